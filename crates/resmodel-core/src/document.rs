//! Normalized resource documents exchanged with adapters and serializers.
//!
//! The shape follows JSON:API: a primary `data` member (single, many or null),
//! `included` side-loaded resources, plus `meta` and `links`. Relationship
//! payloads distinguish an absent `data` member from an explicit `null`,
//! which links-mode relationships depend on.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// `{ type, id?, lid? }` reference to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceIdentifier {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: Some(id.into()),
            lid: None,
        }
    }
}

/// A link is either a bare href or an object with `href` and `meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Link {
    Href(String),
    Object {
        href: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
}

impl Link {
    pub fn href(&self) -> &str {
        match self {
            Link::Href(href) | Link::Object { href, .. } => href,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_link: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<Link>,
}

impl Links {
    pub fn related(href: impl Into<String>) -> Self {
        Self {
            self_link: None,
            related: Some(Link::Href(href.into())),
        }
    }

    pub fn related_href(&self) -> Option<&str> {
        self.related.as_ref().map(Link::href)
    }
}

/// Resource linkage of a relationship payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<ResourceIdentifier>),
    One(ResourceIdentifier),
}

impl Linkage {
    pub fn identifiers(&self) -> Vec<&ResourceIdentifier> {
        match self {
            Linkage::Many(items) => items.iter().collect(),
            Linkage::One(item) => vec![item],
        }
    }
}

/// Relationship member of a resource object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    /// `None` = member absent, `Some(None)` = explicit null.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Option<Linkage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl RelationshipPayload {
    pub fn to_one(identifier: Option<ResourceIdentifier>) -> Self {
        Self {
            data: Some(identifier.map(Linkage::One)),
            ..Self::default()
        }
    }

    pub fn to_many(identifiers: Vec<ResourceIdentifier>) -> Self {
        Self {
            data: Some(Some(Linkage::Many(identifiers))),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_links(mut self, links: Links) -> Self {
        self.links = Some(links);
        self
    }
}

/// A single normalized resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipPayload>,
}

impl ResourceObject {
    pub fn new(type_name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id,
            lid: None,
            attributes: Map::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            type_name: self.type_name.clone(),
            id: self.id.clone(),
            lid: self.lid.clone(),
        }
    }
}

/// Primary data of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<ResourceObject>),
    One(Box<ResourceObject>),
}

/// Inbound/outbound document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub data: Option<PrimaryData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<ResourceObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
}

impl Document {
    /// Document with a single primary resource.
    pub fn single(resource: ResourceObject) -> Self {
        Self {
            data: Some(PrimaryData::One(Box::new(resource))),
            ..Self::default()
        }
    }

    /// Document with a collection of primary resources.
    pub fn many(resources: Vec<ResourceObject>) -> Self {
        Self {
            data: Some(PrimaryData::Many(resources)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_included(mut self, included: Vec<ResourceObject>) -> Self {
        self.included = included;
        self
    }

    /// Parse a JSON value into a document.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Primary resources in document order.
    pub fn primary(&self) -> Vec<&ResourceObject> {
        match &self.data {
            Some(PrimaryData::Many(items)) => items.iter().collect(),
            Some(PrimaryData::One(item)) => vec![item.as_ref()],
            None => Vec::new(),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.data, Some(PrimaryData::Many(_)))
    }
}
