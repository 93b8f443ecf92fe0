use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    contacts (id) {
        id -> Uuid,
        trainer_id -> Uuid,
        crm_contact_id -> Nullable<Text>,
        opted_out -> Bool,
        messages_sent_today -> Integer,
        messages_sent_this_week -> Integer,
        last_message_sent_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    messages (id) {
        id -> Uuid,
        trainer_id -> Uuid,
        contact_id -> Uuid,
        content -> Text,
        channel -> Text,
        status -> Text,
        scheduled_for -> Nullable<Timestamptz>,
        auto_approval_at -> Nullable<Timestamptz>,
        requires_approval -> Bool,
        confidence -> Nullable<Double>,
        edit_count -> Integer,
        external_id -> Nullable<Text>,
        failed_reason -> Nullable<Text>,
        approved_at -> Nullable<Timestamptz>,
        sent_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    trainer_compliance_config (trainer_id) {
        trainer_id -> Uuid,
        quiet_hours_start -> Time,
        quiet_hours_end -> Time,
        frequency_cap_daily -> Integer,
        frequency_cap_weekly -> Integer,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    trainer_edits (id) {
        id -> BigInt,
        message_id -> Uuid,
        original_content -> Text,
        edited_content -> Text,
        original_confidence -> Nullable<Double>,
        created_at -> Timestamptz,
    }
}

joinable!(messages -> contacts (contact_id));
joinable!(trainer_edits -> messages (message_id));

allow_tables_to_appear_in_same_query!(
    contacts,
    messages,
    trainer_compliance_config,
    trainer_edits,
);
