use axum::{routing::get, Router};

use crate::api::handlers::{self, AppState};
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Attributes
        .route(
            "/attribute",
            get(handlers::list_attributes::<S>).post(handlers::create_attribute::<S>),
        )
        .route(
            "/attribute/:id",
            get(handlers::get_attribute::<S>)
                .patch(handlers::update_attribute::<S>)
                .delete(handlers::delete_attribute::<S>),
        )
        // Enum groups
        .route(
            "/enum_group",
            get(handlers::list_enum_groups::<S>).post(handlers::create_enum_group::<S>),
        )
        .route(
            "/enum_group/:id",
            get(handlers::get_enum_group::<S>)
                .patch(handlers::update_enum_group::<S>)
                .delete(handlers::delete_enum_group::<S>),
        )
        // Enum values
        .route(
            "/enum_value",
            get(handlers::list_enum_values::<S>).post(handlers::create_enum_value::<S>),
        )
        .route(
            "/enum_value/:id",
            get(handlers::get_enum_value::<S>)
                .patch(handlers::update_enum_value::<S>)
                .delete(handlers::delete_enum_value::<S>),
        )
        // Host entities with their flat facts
        .route(
            "/entities/:entity_type",
            get(handlers::list_entities::<S>).post(handlers::create_entity::<S>),
        )
        .route(
            "/entities/:entity_type/:id",
            get(handlers::get_entity::<S>)
                .put(handlers::replace_entity::<S>)
                .patch(handlers::patch_entity::<S>)
                .delete(handlers::delete_entity::<S>),
        )
}
