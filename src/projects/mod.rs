pub mod api;
pub mod source;

pub use source::{ProjectListItem, ProjectSource};

use crate::query::facade::EntityQueryFacade;

pub type ProjectsService = EntityQueryFacade<ProjectSource>;
