//! Conversions between typed resources and [`DynamicObject`]s.

use crate::Result;
use kube::{
    api::{ApiResource, DynamicObject},
    core::TypeMeta,
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};

/// Describes a statically typed resource.
pub fn api_resource<K>() -> ApiResource
where
    K: Resource<DynamicType = ()>,
{
    ApiResource::erase::<K>(&())
}

pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Converts an object into `K`, filling in the type metadata list responses
/// omit from their items.
pub fn from_dynamic<K: DeserializeOwned>(
    resource: &ApiResource,
    mut object: DynamicObject,
) -> Result<K> {
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}
