//! ActivityStreams activity model
//!
//! Only the fields federation logic looks at are typed. Everything else
//! survives a decode/encode cycle through `extra`.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Activity types the dispatcher knows about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum ActivityKind {
    Follow,
    Accept,
    Undo,
    Create,
    Delete,
    Like,
    Announce,
    Unknown(String),
}

impl ActivityKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Delete => "Delete",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Unknown(other) => other,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl Default for ActivityKind {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl From<String> for ActivityKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Undo" => Self::Undo,
            "Create" => Self::Create,
            "Delete" => Self::Delete,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            _ => Self::Unknown(value),
        }
    }
}

impl From<ActivityKind> for String {
    fn from(kind: ActivityKind) -> Self {
        match kind {
            ActivityKind::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

// A `type` that is not a string (number, array, null) decodes as unknown
impl<'de> Deserialize<'de> for ActivityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(kind) => Ok(Self::from(kind)),
            _ => Ok(Self::default()),
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded ActivityStreams activity
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(rename = "type", default)]
    pub kind: ActivityKind,
    #[serde(
        default,
        deserialize_with = "deserialize_iri",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    /// Actor IRI; an embedded actor object is reduced to its `id`
    #[serde(
        default,
        deserialize_with = "deserialize_iri",
        skip_serializing_if = "Option::is_none"
    )]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Activity {
    pub fn new(kind: ActivityKind) -> Self {
        Self {
            context: Some(Value::String(ACTIVITY_STREAMS_CONTEXT.to_string())),
            kind,
            ..Default::default()
        }
    }

    /// Canonical JSON encoding used for delivery bodies
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An activity posted to an inbox, with the JSON object it came from
///
/// The typed view drives dispatch. `raw` is what gets echoed back, e.g.
/// as the `object` of an Accept, so nothing the sender wrote is lost.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundActivity {
    pub activity: Activity,
    pub raw: Map<String, Value>,
}

impl InboundActivity {
    /// Decode a request body. Fails on invalid JSON or a non-object body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_slice(body)?)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Value::Object(raw) = value else {
            return Err(serde_json::Error::custom("activity must be a JSON object"));
        };
        let activity = Activity::deserialize(&Value::Object(raw.clone()))?;
        Ok(Self { activity, raw })
    }
}

/// The `object` of an activity
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    /// Bare IRI
    Iri(String),
    /// Embedded activity (e.g. the Follow inside an Undo)
    Activity(Box<Activity>),
    /// Any other embedded object (e.g. the Note of a Create)
    Object(Map<String, Value>),
    /// Arrays and scalars, kept verbatim
    Other(Value),
}

impl ObjectRef {
    /// IRI of the referenced object, embedded or not
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Iri(iri) => Some(iri),
            Self::Activity(activity) => activity.id.as_deref(),
            Self::Object(map) => map.get("id").and_then(Value::as_str),
            Self::Other(_) => None,
        }
    }

    pub fn as_activity(&self) -> Option<&Activity> {
        match self {
            Self::Activity(activity) => Some(activity),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Iri(iri) => serializer.serialize_str(iri),
            Self::Activity(activity) => activity.serialize(serializer),
            Self::Object(map) => map.serialize(serializer),
            Self::Other(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(iri) => Ok(Self::Iri(iri)),
            Value::Object(map) => {
                let embeds_activity = map
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|kind| ActivityKind::from(kind.to_string()).is_known());

                if embeds_activity {
                    serde_json::from_value(Value::Object(map))
                        .map(|activity| Self::Activity(Box::new(activity)))
                        .map_err(D::Error::custom)
                } else {
                    Ok(Self::Object(map))
                }
            }
            other => Ok(Self::Other(other)),
        }
    }
}

/// IRI of a JSON value that is either a string or an object with an `id`
pub fn iri_of(value: &Value) -> Option<String> {
    match value {
        Value::String(iri) => Some(iri.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn deserialize_iri<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(iri_of))
}
