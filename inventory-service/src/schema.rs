diesel::table! {
    processed_commands (idempotency_key) {
        idempotency_key -> Varchar,
        command_id -> Uuid,
        result -> Nullable<Jsonb>,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        variant_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        cart_ref -> Nullable<Varchar>,
        order_ref -> Nullable<Varchar>,
        release_reason -> Nullable<Varchar>,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_alerts (id) {
        id -> Uuid,
        variant_id -> Uuid,
        alert_type -> Varchar,
        available_quantity -> Int4,
        threshold -> Int4,
        is_resolved -> Bool,
        created_at -> Timestamptz,
        resolved_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    stock_movements (id) {
        id -> Int8,
        variant_id -> Uuid,
        movement_type -> Varchar,
        quantity_delta -> Int4,
        quantity_before -> Int4,
        quantity_after -> Int4,
        reason -> Varchar,
        reference_id -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    variant_stock (variant_id) {
        variant_id -> Uuid,
        product_id -> Uuid,
        sku -> Varchar,
        quantity_on_hand -> Int4,
        quantity_reserved -> Int4,
        low_stock_threshold -> Nullable<Int4>,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(reservations -> variant_stock (variant_id));
diesel::joinable!(stock_alerts -> variant_stock (variant_id));
diesel::joinable!(stock_movements -> variant_stock (variant_id));

diesel::allow_tables_to_appear_in_same_query!(
    processed_commands,
    reservations,
    stock_alerts,
    stock_movements,
    variant_stock,
);
