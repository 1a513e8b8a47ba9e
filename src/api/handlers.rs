use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use super::types::{
    CreateCollectionRequest, DeleteResponse, ExportQuery, OwnerQuery, RefreshResponse, TrackedAddressesResponse,
};
use crate::error::MonitorError;
use crate::monitor::{
    AddressRef, AddressUpdate, Monitor, NewAddress, Selector, SourceKind, SourceSpec, StateSnapshot, TrackingEvent,
    TrackingOutcome,
};
use crate::storage::{AddressRecord, CollectionMap, Source};

pub async fn get_state_handler(State(monitor): State<Arc<Monitor>>) -> Json<StateSnapshot> {
    Json(monitor.snapshot().await)
}

pub async fn create_collection_handler(
    State(monitor): State<Arc<Monitor>>,
    Json(req): Json<CreateCollectionRequest>,
) -> Result<Json<StateSnapshot>, MonitorError> {
    let snapshot = monitor.add_collection(req.name.trim()).await?;
    Ok(Json(snapshot))
}

pub async fn delete_collection_handler(
    State(monitor): State<Arc<Monitor>>,
    Path(collection): Path<String>,
) -> Result<Json<DeleteResponse>, MonitorError> {
    monitor.delete_collection(&collection).await?;
    Ok(Json(DeleteResponse::deleted(collection)))
}

pub async fn add_address_handler(
    State(monitor): State<Arc<Monitor>>,
    Path(collection): Path<String>,
    Json(req): Json<NewAddress>,
) -> Result<Json<AddressRecord>, MonitorError> {
    let record = monitor.add_address(&collection, req).await?;
    Ok(Json(record))
}

pub async fn update_address_handler(
    State(monitor): State<Arc<Monitor>>,
    Path((collection, address)): Path<(String, String)>,
    Query(owner): Query<OwnerQuery>,
    Json(update): Json<AddressUpdate>,
) -> Result<Json<AddressRecord>, MonitorError> {
    let item = owner.into_ref(collection, address);
    let record = monitor.update_address(&item, update).await?;
    Ok(Json(record))
}

pub async fn delete_address_handler(
    State(monitor): State<Arc<Monitor>>,
    Path((collection, address)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, MonitorError> {
    monitor.delete_address(&collection, &address).await?;
    Ok(Json(DeleteResponse::deleted(address)))
}

pub async fn add_extended_key_handler(
    State(monitor): State<Arc<Monitor>>,
    Path(collection): Path<String>,
    Json(spec): Json<SourceSpec>,
) -> Result<Json<Source>, MonitorError> {
    let source = monitor.add_source(&collection, SourceKind::ExtendedKey, spec).await?;
    Ok(Json(source))
}

pub async fn update_extended_key_handler(
    State(monitor): State<Arc<Monitor>>,
    Path((collection, name)): Path<(String, String)>,
    Json(spec): Json<SourceSpec>,
) -> Result<Json<Source>, MonitorError> {
    let source = monitor
        .update_source(&collection, SourceKind::ExtendedKey, &name, spec)
        .await?;
    Ok(Json(source))
}

pub async fn delete_extended_key_handler(
    State(monitor): State<Arc<Monitor>>,
    Path((collection, name)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, MonitorError> {
    monitor
        .delete_source(&collection, SourceKind::ExtendedKey, &name)
        .await?;
    Ok(Json(DeleteResponse::deleted(name)))
}

pub async fn add_descriptor_handler(
    State(monitor): State<Arc<Monitor>>,
    Path(collection): Path<String>,
    Json(spec): Json<SourceSpec>,
) -> Result<Json<Source>, MonitorError> {
    let source = monitor.add_source(&collection, SourceKind::Descriptor, spec).await?;
    Ok(Json(source))
}

pub async fn update_descriptor_handler(
    State(monitor): State<Arc<Monitor>>,
    Path((collection, name)): Path<(String, String)>,
    Json(spec): Json<SourceSpec>,
) -> Result<Json<Source>, MonitorError> {
    let source = monitor
        .update_source(&collection, SourceKind::Descriptor, &name, spec)
        .await?;
    Ok(Json(source))
}

pub async fn delete_descriptor_handler(
    State(monitor): State<Arc<Monitor>>,
    Path((collection, name)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, MonitorError> {
    monitor
        .delete_source(&collection, SourceKind::Descriptor, &name)
        .await?;
    Ok(Json(DeleteResponse::deleted(name)))
}

pub async fn refresh_handler(
    State(monitor): State<Arc<Monitor>>,
    Json(selector): Json<Selector>,
) -> Result<Json<RefreshResponse>, MonitorError> {
    let queued = monitor.refresh(&selector).await?;
    Ok(Json(RefreshResponse { queued }))
}

pub async fn accept_handler(
    State(monitor): State<Arc<Monitor>>,
    Json(item): Json<AddressRef>,
) -> Result<Json<AddressRecord>, MonitorError> {
    let record = monitor.accept(&item).await?;
    Ok(Json(record))
}

pub async fn export_handler(
    State(monitor): State<Arc<Monitor>>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<CollectionMap>, MonitorError> {
    let collections = monitor.export(query.collection.as_deref()).await?;
    Ok(Json(collections))
}

pub async fn import_handler(
    State(monitor): State<Arc<Monitor>>,
    Json(collections): Json<CollectionMap>,
) -> Result<Json<StateSnapshot>, MonitorError> {
    let snapshot = monitor.import(collections).await?;
    Ok(Json(snapshot))
}

pub async fn tracking_event_handler(
    State(monitor): State<Arc<Monitor>>,
    Json(event): Json<TrackingEvent>,
) -> Result<Json<TrackingOutcome>, MonitorError> {
    let outcome = monitor.apply_tracking_event(&event).await?;
    Ok(Json(outcome))
}

pub async fn tracked_addresses_handler(State(monitor): State<Arc<Monitor>>) -> Json<TrackedAddressesResponse> {
    Json(TrackedAddressesResponse {
        addresses: monitor.tracked_addresses().await,
    })
}
