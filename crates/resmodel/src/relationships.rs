//! Inverse-consistent relationship writes.
//!
//! Every relationship write goes through [`replace_relationship`], which diffs
//! the old and new membership and patches the inverse field of each added or
//! removed member in the same layer. The canonical layer is the cache; the
//! local layer is the mutation overlay with the cache underneath.

use crate::store::StoreInner;
use resmodel_cache::RelationshipData;
use resmodel_core::{
    Error, FieldKind, FieldSchema, LinksModeError, LinksModeErrorKind, ResourceKey, Result,
};
use std::collections::BTreeSet;

/// Which copy of relationship data a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layer {
    /// Server-acknowledged data in the cache.
    Canonical,
    /// Uncommitted edits layered over the cache.
    Local,
}

impl Layer {
    pub(crate) const fn for_mode(editable: bool) -> Self {
        if editable { Layer::Local } else { Layer::Canonical }
    }
}

/// Current linkage of `field` on `key` as seen through `layer`.
pub(crate) fn read(
    inner: &StoreInner,
    layer: Layer,
    key: &ResourceKey,
    field: &str,
) -> Option<RelationshipData> {
    match layer {
        Layer::Canonical => inner.cache.relationship_data(key, field).cloned(),
        Layer::Local => inner
            .overlay
            .relationship(key, field)
            .or_else(|| inner.cache.relationship_data(key, field))
            .cloned(),
    }
}

fn write(
    inner: &mut StoreInner,
    layer: Layer,
    key: &ResourceKey,
    field: &str,
    data: RelationshipData,
) -> Result<bool> {
    match layer {
        Layer::Canonical => {
            inner.cache.insert_empty(key);
            inner.cache.set_relationship(key, field, Some(data))
        }
        Layer::Local => {
            let canonical = inner.cache.relationship_data(key, field).cloned();
            Ok(inner
                .overlay
                .set_relationship(key, field, data, canonical.as_ref()))
        }
    }
}

/// Coerce linkage to the cardinality of `field`, dropping duplicate members.
pub(crate) fn normalize(field: &FieldSchema, data: RelationshipData) -> RelationshipData {
    let many = field.kind == FieldKind::HasMany;
    match data {
        RelationshipData::Many(keys) if many => {
            let mut seen = BTreeSet::new();
            RelationshipData::Many(
                keys.into_iter()
                    .filter(|key| seen.insert(key.clone()))
                    .collect(),
            )
        }
        RelationshipData::Many(keys) => RelationshipData::One(keys.into_iter().next()),
        RelationshipData::One(key) if many => RelationshipData::Many(key.into_iter().collect()),
        one @ RelationshipData::One(_) => one,
    }
}

/// Replace the membership of `owner.field` and keep every inverse in step.
///
/// Returns the keys whose data changed in `layer`.
#[tracing::instrument(level = "trace", skip(inner, owner, field, new), fields(owner = %owner, field = %field.name))]
pub(crate) fn replace_relationship(
    inner: &mut StoreInner,
    layer: Layer,
    owner: &ResourceKey,
    field: &FieldSchema,
    new: RelationshipData,
) -> Result<BTreeSet<ResourceKey>> {
    let new = normalize(field, new);
    let old = read(inner, layer, owner, &field.name)
        .unwrap_or_else(|| RelationshipData::empty(field.kind == FieldKind::HasMany));

    // Resolve every inverse field before the first write.
    let mut removals = Vec::new();
    let mut additions = Vec::new();
    // `resource` references carry no inverse bookkeeping.
    if let Some(inverse) = field.inverse().filter(|_| field.kind != FieldKind::Resource) {
        let old_keys = old.keys();
        let new_keys = new.keys();
        for removed in old_keys.iter().filter(|key| !new_keys.contains(key)) {
            let inverse_field = inner.schemas.field(removed.type_name(), inverse)?;
            removals.push((removed.clone(), inverse_field));
        }
        for added in new_keys.iter().filter(|key| !old_keys.contains(key)) {
            let inverse_field = inner.schemas.field(added.type_name(), inverse)?;
            additions.push((added.clone(), inverse_field));
        }
    }

    let mut touched = BTreeSet::new();
    if write(inner, layer, owner, &field.name, new)? {
        touched.insert(owner.clone());
    }
    for (removed, inverse_field) in &removals {
        remove_member(inner, layer, removed, &inverse_field.name, owner, &mut touched)?;
    }
    for (added, inverse_field) in &additions {
        add_inverse(inner, layer, added, inverse_field, owner, &field.name, &mut touched)?;
    }

    if !touched.is_empty() {
        tracing::trace!(touched = touched.len(), "Synchronized inverse relationships");
    }
    Ok(touched)
}

/// Drop `member` from `holder.field` without further inverse bookkeeping.
pub(crate) fn remove_member(
    inner: &mut StoreInner,
    layer: Layer,
    holder: &ResourceKey,
    field: &str,
    member: &ResourceKey,
    touched: &mut BTreeSet<ResourceKey>,
) -> Result<()> {
    let Some(mut data) = read(inner, layer, holder, field) else {
        return Ok(());
    };
    let changed = match &mut data {
        RelationshipData::One(slot) if slot.as_ref() == Some(member) => {
            *slot = None;
            true
        }
        RelationshipData::Many(keys) => {
            let before = keys.len();
            keys.retain(|key| key != member);
            keys.len() != before
        }
        RelationshipData::One(_) => false,
    };
    if changed && write(inner, layer, holder, field, data)? {
        touched.insert(holder.clone());
    }
    Ok(())
}

fn add_inverse(
    inner: &mut StoreInner,
    layer: Layer,
    member: &ResourceKey,
    inverse_field: &FieldSchema,
    owner: &ResourceKey,
    forward_field: &str,
    touched: &mut BTreeSet<ResourceKey>,
) -> Result<()> {
    if inverse_field.kind == FieldKind::HasMany {
        let mut keys = read(inner, layer, member, &inverse_field.name)
            .map(|data| data.keys())
            .unwrap_or_default();
        if !keys.contains(owner) {
            keys.push(owner.clone());
            if write(inner, layer, member, &inverse_field.name, RelationshipData::Many(keys))? {
                touched.insert(member.clone());
            }
        }
        return Ok(());
    }

    // A to-one inverse can only point at one owner; release the previous one.
    let previous = match read(inner, layer, member, &inverse_field.name) {
        Some(RelationshipData::One(Some(previous))) if previous != *owner => Some(previous),
        _ => None,
    };
    if let Some(previous) = previous {
        remove_member(inner, layer, &previous, forward_field, member, touched)?;
    }
    let data = RelationshipData::One(Some(owner.clone()));
    if write(inner, layer, member, &inverse_field.name, data)? {
        touched.insert(member.clone());
    }
    Ok(())
}

/// Linkage of `field` for a read in the given mode.
///
/// Links-mode fields fail fast unless the payload carried `links.related`,
/// defined `data`, and every member is loaded. Local edits bypass the check.
pub(crate) fn resolve_for_read(
    inner: &StoreInner,
    key: &ResourceKey,
    editable: bool,
    field: &FieldSchema,
) -> Result<RelationshipData> {
    let many = field.kind == FieldKind::HasMany;
    if editable {
        if let Some(local) = inner.overlay.relationship(key, &field.name) {
            return Ok(normalize(field, local.clone()));
        }
    }

    let state = inner.cache.relationship(key, &field.name);
    if !field.options.links_mode {
        return Ok(state
            .and_then(|state| state.data.clone())
            .map_or_else(|| RelationshipData::empty(many), |data| normalize(field, data)));
    }

    let assertion = |kind, related: Option<String>| {
        Error::LinksModeAssertion(LinksModeError {
            kind,
            type_name: key.type_name().to_string(),
            field: field.name.clone(),
            related,
        })
    };
    let has_related_link = state
        .and_then(|state| state.links.as_ref())
        .and_then(|links| links.related_href())
        .is_some();
    if !has_related_link {
        return Err(assertion(LinksModeErrorKind::MissingRelatedLink, None));
    }
    let Some(data) = state.and_then(|state| state.data.clone()) else {
        return Err(assertion(LinksModeErrorKind::UndefinedData, None));
    };
    if let Some(missing) = data
        .keys()
        .into_iter()
        .find(|member| !inner.has_data(member))
    {
        return Err(assertion(
            LinksModeErrorKind::MissingIncluded,
            Some(missing.to_string()),
        ));
    }
    Ok(normalize(field, data))
}
