//! Resource path below the service root, e.g. `Products(42)/Category`.

use odata_core::{EntityKey, parse_key};

use crate::error::ServiceError;

#[derive(Clone, Debug, PartialEq)]
pub enum ResourcePath {
    ServiceDocument,
    Metadata,
    Collection {
        set: String,
    },
    Count {
        set: String,
    },
    Entity {
        set: String,
        key: EntityKey,
    },
    Navigation {
        set: String,
        key: EntityKey,
        navigation: String,
    },
    /// `Set/<ns>.<action>`
    CollectionAction {
        set: String,
        action: String,
    },
    /// `Set(key)/<ns>.<action>`
    EntityAction {
        set: String,
        key: EntityKey,
        action: String,
    },
}

impl ResourcePath {
    /// Entity-set segment, when the path has one.
    #[must_use]
    pub fn entity_set(&self) -> Option<&str> {
        match self {
            ResourcePath::ServiceDocument | ResourcePath::Metadata => None,
            ResourcePath::Collection { set }
            | ResourcePath::Count { set }
            | ResourcePath::Entity { set, .. }
            | ResourcePath::Navigation { set, .. }
            | ResourcePath::CollectionAction { set, .. }
            | ResourcePath::EntityAction { set, .. } => Some(set),
        }
    }
}

/// Split `Name(key)` into the name and the raw key text.
fn split_key(segment: &str) -> Result<(&str, Option<&str>), ServiceError> {
    let Some(open) = segment.find('(') else {
        return Ok((segment, None));
    };
    let Some(inner) = segment[open + 1..].strip_suffix(')') else {
        return Err(odata_core::Error::InvalidKey(format!("unbalanced key in '{segment}'")).into());
    };
    Ok((&segment[..open], Some(inner)))
}

fn decode(segment: &str) -> Result<String, ServiceError> {
    urlencoding::decode(segment)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| ServiceError::NoSuchResource(segment.to_owned()))
}

/// Parse the part of the request path after the service root.
///
/// `namespace` qualifies action segments (`Default.discount`).
///
/// # Errors
/// `NoSuchResource` for shapes the service does not address, `InvalidKey`
/// for malformed key predicates.
pub fn parse(path: &str, namespace: &str) -> Result<ResourcePath, ServiceError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(ResourcePath::ServiceDocument);
    }

    let segments = trimmed
        .split('/')
        .map(decode)
        .collect::<Result<Vec<_>, _>>()?;
    let not_found = || ServiceError::NoSuchResource(trimmed.to_owned());

    if segments.len() == 1 && segments[0] == "$metadata" {
        return Ok(ResourcePath::Metadata);
    }

    let (set, raw_key) = split_key(&segments[0])?;
    if set.is_empty() || set.starts_with('$') {
        return Err(not_found());
    }
    let set = set.to_owned();
    let key = raw_key.map(parse_key).transpose()?;
    let action_prefix = format!("{namespace}.");

    match (key, segments.get(1), segments.len()) {
        (None, None, _) => Ok(ResourcePath::Collection { set }),
        (Some(key), None, _) => Ok(ResourcePath::Entity { set, key }),
        (None, Some(seg), 2) if seg == "$count" => Ok(ResourcePath::Count { set }),
        (None, Some(seg), 2) => match seg.strip_prefix(&action_prefix) {
            Some(action) if !action.is_empty() => Ok(ResourcePath::CollectionAction {
                set,
                action: action.to_owned(),
            }),
            _ => Err(not_found()),
        },
        (Some(key), Some(seg), 2) => match seg.strip_prefix(&action_prefix) {
            Some(action) if !action.is_empty() => Ok(ResourcePath::EntityAction {
                set,
                key,
                action: action.to_owned(),
            }),
            Some(_) => Err(not_found()),
            None if seg.starts_with('$') => Err(not_found()),
            None => Ok(ResourcePath::Navigation {
                set,
                key,
                navigation: seg.clone(),
            }),
        },
        _ => Err(not_found()),
    }
}
