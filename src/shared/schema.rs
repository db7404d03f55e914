diesel::table! {
    organizations (org_id) {
        org_id -> Uuid,
        name -> Text,
        slug -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    pipeline_statuses (id) {
        id -> Uuid,
        org_id -> Uuid,
        entity_kind -> Text,
        name -> Text,
        color -> Nullable<Text>,
        sort_order -> Int4,
    }
}

// Baseline columns only. Deployments that have run newer migrations also
// carry last_contacted_at / archived_at; those are selected dynamically
// through sql_query so a missing column downgrades instead of failing the
// whole table mapping.
diesel::table! {
    leads (id) {
        id -> Uuid,
        org_id -> Uuid,
        client_name -> Text,
        email -> Nullable<Text>,
        phone -> Nullable<Text>,
        source -> Nullable<Text>,
        session_type -> Nullable<Text>,
        status_id -> Nullable<Uuid>,
        notes -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    projects (id) {
        id -> Uuid,
        org_id -> Uuid,
        lead_id -> Nullable<Uuid>,
        name -> Text,
        client_name -> Text,
        status_id -> Nullable<Uuid>,
        shoot_date -> Nullable<Date>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    shoot_sessions (id) {
        id -> Uuid,
        org_id -> Uuid,
        project_id -> Uuid,
        title -> Text,
        scheduled_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    payments (id) {
        id -> Uuid,
        org_id -> Uuid,
        project_id -> Uuid,
        amount -> Float8,
        paid_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    custom_field_definitions (id) {
        id -> Uuid,
        org_id -> Uuid,
        entity_kind -> Text,
        field_key -> Text,
        label -> Text,
        field_type -> Text,
        options -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    custom_field_values (id) {
        id -> Uuid,
        entity_kind -> Text,
        entity_id -> Uuid,
        field_key -> Text,
        value -> Nullable<Text>,
    }
}

diesel::table! {
    custom_field_values_typed (entity_kind, entity_id, field_key) {
        entity_kind -> Text,
        entity_id -> Uuid,
        org_id -> Uuid,
        field_key -> Text,
        value_text -> Nullable<Text>,
        value_bool -> Nullable<Bool>,
        value_date -> Nullable<Date>,
        value_number -> Nullable<Float8>,
    }
}

diesel::joinable!(leads -> pipeline_statuses (status_id));
diesel::joinable!(projects -> pipeline_statuses (status_id));
diesel::joinable!(shoot_sessions -> projects (project_id));
diesel::joinable!(payments -> projects (project_id));

diesel::allow_tables_to_appear_in_same_query!(
    organizations,
    pipeline_statuses,
    leads,
    projects,
    shoot_sessions,
    payments,
    custom_field_definitions,
    custom_field_values,
    custom_field_values_typed,
);
