use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Path, Request, State},
    http::StatusCode,
    response::Json,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::error::{EavError, FieldError, StoreError};
use crate::logic::{AttributeView, EavService};
use crate::model::{
    AttributeInput, AttributeUpdate, EnumGroup, EnumGroupUpdate, EnumValue, Id, NewEnumGroup,
    NewEnumValue, WriteMode,
};
use crate::store::traits::Store;

pub type AppState<S> = Arc<EavService<S>>;

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<T, ApiError>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<FieldError>,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
            details: Vec::new(),
        }
    }
}

fn status_for(err: &EavError) -> StatusCode {
    match err {
        EavError::InvalidPayload(_)
        | EavError::InvalidValue { .. }
        | EavError::SchemaInconsistency { .. } => StatusCode::BAD_REQUEST,
        EavError::Fact { source, .. } => match status_for(source) {
            StatusCode::INTERNAL_SERVER_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::CONFLICT => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        },
        EavError::UnknownEntityType(_) | EavError::NotFound { .. } => StatusCode::NOT_FOUND,
        EavError::Conflict(_) => StatusCode::CONFLICT,
        EavError::Registration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EavError::Store(store_err) => match store_err {
            StoreError::UniqueViolation { .. }
            | StoreError::ForeignKeyViolation { .. }
            | StoreError::SerializationFailure => StatusCode::CONFLICT,
            StoreError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Corrupt(_) | StoreError::Database(_) | StoreError::Migration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
    }
}

/// Map a failed operation onto a status and a structured error body.
pub fn error_response(err: EavError) -> ApiError {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("Request failed: {}", err);
    } else {
        log::debug!("Request rejected ({}): {}", status, err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            details: err.field_errors(),
        }),
    )
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    let status = match &rejection {
        JsonRejection::JsonDataError(_) | JsonRejection::JsonSyntaxError(_) => {
            StatusCode::BAD_REQUEST
        }
        other => other.status(),
    };
    log::debug!("Request body rejected ({}): {}", status, rejection.body_text());
    (status, Json(ErrorResponse::new(&rejection.body_text())))
}

/// `Json` body extractor whose rejections use the `ErrorResponse` shape.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, St> FromRequest<St> for JsonBody<T>
where
    T: DeserializeOwned,
    St: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &St) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn created_status(created: bool) -> StatusCode {
    if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

// Attributes

pub async fn list_attributes<S: Store>(
    State(service): State<AppState<S>>,
) -> ApiResult<Json<ListResponse<AttributeView>>> {
    match service.list_attributes().await {
        Ok(attributes) => Ok(Json(attributes.into())),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn create_attribute<S: Store>(
    State(service): State<AppState<S>>,
    JsonBody(input): JsonBody<AttributeInput>,
) -> ApiResult<(StatusCode, Json<AttributeView>)> {
    match service.create_attribute(input).await {
        Ok((attribute, created)) => Ok((created_status(created), Json(attribute))),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn get_attribute<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
) -> ApiResult<Json<AttributeView>> {
    service
        .get_attribute(id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn update_attribute<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
    JsonBody(update): JsonBody<AttributeUpdate>,
) -> ApiResult<Json<AttributeView>> {
    service
        .update_attribute(id, update)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_attribute<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
) -> ApiResult<StatusCode> {
    service
        .delete_attribute(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

// Enum groups

pub async fn list_enum_groups<S: Store>(
    State(service): State<AppState<S>>,
) -> ApiResult<Json<ListResponse<EnumGroup>>> {
    service
        .list_enum_groups()
        .await
        .map(|groups| Json(groups.into()))
        .map_err(error_response)
}

pub async fn create_enum_group<S: Store>(
    State(service): State<AppState<S>>,
    JsonBody(group): JsonBody<NewEnumGroup>,
) -> ApiResult<(StatusCode, Json<EnumGroup>)> {
    match service.create_enum_group(group).await {
        Ok((group, created)) => Ok((created_status(created), Json(group))),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn get_enum_group<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
) -> ApiResult<Json<EnumGroup>> {
    service
        .get_enum_group(id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn update_enum_group<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
    JsonBody(update): JsonBody<EnumGroupUpdate>,
) -> ApiResult<Json<EnumGroup>> {
    service
        .update_enum_group(id, update)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_enum_group<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
) -> ApiResult<StatusCode> {
    service
        .delete_enum_group(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

// Enum values

pub async fn list_enum_values<S: Store>(
    State(service): State<AppState<S>>,
) -> ApiResult<Json<ListResponse<EnumValue>>> {
    service
        .list_enum_values()
        .await
        .map(|values| Json(values.into()))
        .map_err(error_response)
}

pub async fn create_enum_value<S: Store>(
    State(service): State<AppState<S>>,
    JsonBody(value): JsonBody<NewEnumValue>,
) -> ApiResult<(StatusCode, Json<EnumValue>)> {
    service
        .create_enum_value(value)
        .await
        .map(|value| (StatusCode::CREATED, Json(value)))
        .map_err(error_response)
}

pub async fn get_enum_value<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
) -> ApiResult<Json<EnumValue>> {
    service
        .get_enum_value(id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn update_enum_value<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
    JsonBody(value): JsonBody<NewEnumValue>,
) -> ApiResult<Json<EnumValue>> {
    service
        .update_enum_value(id, value)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_enum_value<S: Store>(
    State(service): State<AppState<S>>,
    Path(id): Path<Id>,
) -> ApiResult<StatusCode> {
    service
        .delete_enum_value(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

// Host entities

pub async fn list_entities<S: Store>(
    State(service): State<AppState<S>>,
    Path(entity_type): Path<String>,
) -> ApiResult<Json<ListResponse<JsonValue>>> {
    service
        .list(&entity_type)
        .await
        .map(|entities| Json(entities.into()))
        .map_err(error_response)
}

pub async fn create_entity<S: Store>(
    State(service): State<AppState<S>>,
    Path(entity_type): Path<String>,
    JsonBody(body): JsonBody<JsonValue>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    service
        .create(&entity_type, &body)
        .await
        .map(|entity| (StatusCode::CREATED, Json(entity)))
        .map_err(error_response)
}

pub async fn get_entity<S: Store>(
    State(service): State<AppState<S>>,
    Path((entity_type, id)): Path<(String, Id)>,
) -> ApiResult<Json<JsonValue>> {
    service
        .read(&entity_type, id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn replace_entity<S: Store>(
    State(service): State<AppState<S>>,
    Path((entity_type, id)): Path<(String, Id)>,
    JsonBody(body): JsonBody<JsonValue>,
) -> ApiResult<Json<JsonValue>> {
    service
        .update(&entity_type, id, &body, WriteMode::Replace)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn patch_entity<S: Store>(
    State(service): State<AppState<S>>,
    Path((entity_type, id)): Path<(String, Id)>,
    JsonBody(body): JsonBody<JsonValue>,
) -> ApiResult<Json<JsonValue>> {
    service
        .update(&entity_type, id, &body, WriteMode::Patch)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_entity<S: Store>(
    State(service): State<AppState<S>>,
    Path((entity_type, id)): Path<(String, Id)>,
) -> ApiResult<StatusCode> {
    service
        .delete(&entity_type, id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}
