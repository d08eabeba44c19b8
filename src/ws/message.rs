//! Messages of the WAMP basic profile, JSON serialized.
//!
//! Every message is a JSON array whose first element is the message code.
//! Trailing payload fields are only written when they carry something.

use serde_json::{Map, Value, json};

use super::error::WsError;

/// JSON serializer subprotocol offered during the WebSocket handshake.
pub const SUBPROTOCOL: &str = "wamp.2.json";

const HELLO: u64 = 1;
const WELCOME: u64 = 2;
const ABORT: u64 = 3;
const GOODBYE: u64 = 6;
const ERROR: u64 = 8;
const PUBLISH: u64 = 16;
const PUBLISHED: u64 = 17;
const SUBSCRIBE: u64 = 32;
const SUBSCRIBED: u64 = 33;
const UNSUBSCRIBE: u64 = 34;
const UNSUBSCRIBED: u64 = 35;
const EVENT: u64 = 36;
const CALL: u64 = 48;
const RESULT: u64 = 50;

/// Reason sent when leaving a realm.
pub const CLOSE_REALM: &str = "wamp.close.close_realm";
/// Reason sent when acknowledging a GOODBYE from the router.
pub const GOODBYE_AND_OUT: &str = "wamp.close.goodbye_and_out";

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum WampMessage {
    Hello {
        realm: String,
        details: Map<String, Value>,
    },
    Welcome {
        session: u64,
        details: Map<String, Value>,
    },
    Abort {
        details: Map<String, Value>,
        reason: String,
    },
    Goodbye {
        details: Map<String, Value>,
        reason: String,
    },
    Error {
        request_type: u64,
        request: u64,
        details: Map<String, Value>,
        error: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Publish {
        request: u64,
        options: Map<String, Value>,
        topic: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Published {
        request: u64,
        publication: u64,
    },
    Subscribe {
        request: u64,
        options: Map<String, Value>,
        topic: String,
    },
    Subscribed {
        request: u64,
        subscription: u64,
    },
    Unsubscribe {
        request: u64,
        subscription: u64,
    },
    Unsubscribed {
        request: u64,
    },
    Event {
        subscription: u64,
        publication: u64,
        details: Map<String, Value>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Call {
        request: u64,
        options: Map<String, Value>,
        procedure: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Result {
        request: u64,
        details: Map<String, Value>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
}

impl WampMessage {
    /// HELLO announcing the client roles.
    #[must_use]
    pub fn hello<S: Into<String>>(realm: S) -> Self {
        let details = json!({
            "agent": concat!("wampli/", env!("CARGO_PKG_VERSION")),
            "roles": {
                "caller": {},
                "publisher": {},
                "subscriber": {"features": {"pattern_based_subscription": true}},
            },
        });

        Self::Hello {
            realm: realm.into(),
            details: object(details),
        }
    }

    /// Request id of replies, `None` for everything else.
    #[must_use]
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            Self::Error { request, .. }
            | Self::Published { request, .. }
            | Self::Subscribed { request, .. }
            | Self::Unsubscribed { request }
            | Self::Result { request, .. } => Some(*request),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let fields = match self {
            Self::Hello { realm, details } => vec![json!(HELLO), json!(realm), json!(details)],
            Self::Welcome { session, details } => {
                vec![json!(WELCOME), json!(session), json!(details)]
            }
            Self::Abort { details, reason } => vec![json!(ABORT), json!(details), json!(reason)],
            Self::Goodbye { details, reason } => {
                vec![json!(GOODBYE), json!(details), json!(reason)]
            }
            Self::Error {
                request_type,
                request,
                details,
                error,
                args,
                kwargs,
            } => with_payload(
                vec![
                    json!(ERROR),
                    json!(request_type),
                    json!(request),
                    json!(details),
                    json!(error),
                ],
                args,
                kwargs,
            ),
            Self::Publish {
                request,
                options,
                topic,
                args,
                kwargs,
            } => with_payload(
                vec![json!(PUBLISH), json!(request), json!(options), json!(topic)],
                args,
                kwargs,
            ),
            Self::Published {
                request,
                publication,
            } => vec![json!(PUBLISHED), json!(request), json!(publication)],
            Self::Subscribe {
                request,
                options,
                topic,
            } => vec![json!(SUBSCRIBE), json!(request), json!(options), json!(topic)],
            Self::Subscribed {
                request,
                subscription,
            } => vec![json!(SUBSCRIBED), json!(request), json!(subscription)],
            Self::Unsubscribe {
                request,
                subscription,
            } => vec![json!(UNSUBSCRIBE), json!(request), json!(subscription)],
            Self::Unsubscribed { request } => vec![json!(UNSUBSCRIBED), json!(request)],
            Self::Event {
                subscription,
                publication,
                details,
                args,
                kwargs,
            } => with_payload(
                vec![
                    json!(EVENT),
                    json!(subscription),
                    json!(publication),
                    json!(details),
                ],
                args,
                kwargs,
            ),
            Self::Call {
                request,
                options,
                procedure,
                args,
                kwargs,
            } => with_payload(
                vec![json!(CALL), json!(request), json!(options), json!(procedure)],
                args,
                kwargs,
            ),
            Self::Result {
                request,
                details,
                args,
                kwargs,
            } => with_payload(
                vec![json!(RESULT), json!(request), json!(details)],
                args,
                kwargs,
            ),
        };

        Value::Array(fields)
    }

    /// Serialize for a text frame.
    pub fn encode(&self) -> Result<String, WsError> {
        serde_json::to_string(&self.to_json()).map_err(WsError::MessageParse)
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, WsError> {
        let value: Value = serde_json::from_str(text).map_err(WsError::MessageParse)?;
        Self::from_json(value)
    }

    pub fn from_json(value: Value) -> Result<Self, WsError> {
        let Value::Array(items) = value else {
            return Err(WsError::InvalidMessage("message is not an array".to_owned()));
        };
        let mut fields = Fields(items.into_iter());
        let code = fields.id("message code")?;

        let message = match code {
            HELLO => Self::Hello {
                realm: fields.uri("realm")?,
                details: fields.dict("details")?,
            },
            WELCOME => Self::Welcome {
                session: fields.id("session")?,
                details: fields.dict("details")?,
            },
            ABORT => Self::Abort {
                details: fields.dict("details")?,
                reason: fields.uri("reason")?,
            },
            GOODBYE => Self::Goodbye {
                details: fields.dict("details")?,
                reason: fields.uri("reason")?,
            },
            ERROR => Self::Error {
                request_type: fields.id("request type")?,
                request: fields.id("request")?,
                details: fields.dict("details")?,
                error: fields.uri("error")?,
                args: fields.list_opt("arguments")?,
                kwargs: fields.dict_opt("keyword arguments")?,
            },
            PUBLISH => Self::Publish {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                topic: fields.uri("topic")?,
                args: fields.list_opt("arguments")?,
                kwargs: fields.dict_opt("keyword arguments")?,
            },
            PUBLISHED => Self::Published {
                request: fields.id("request")?,
                publication: fields.id("publication")?,
            },
            SUBSCRIBE => Self::Subscribe {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                topic: fields.uri("topic")?,
            },
            SUBSCRIBED => Self::Subscribed {
                request: fields.id("request")?,
                subscription: fields.id("subscription")?,
            },
            UNSUBSCRIBE => Self::Unsubscribe {
                request: fields.id("request")?,
                subscription: fields.id("subscription")?,
            },
            UNSUBSCRIBED => Self::Unsubscribed {
                request: fields.id("request")?,
            },
            EVENT => Self::Event {
                subscription: fields.id("subscription")?,
                publication: fields.id("publication")?,
                details: fields.dict("details")?,
                args: fields.list_opt("arguments")?,
                kwargs: fields.dict_opt("keyword arguments")?,
            },
            CALL => Self::Call {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                procedure: fields.uri("procedure")?,
                args: fields.list_opt("arguments")?,
                kwargs: fields.dict_opt("keyword arguments")?,
            },
            RESULT => Self::Result {
                request: fields.id("request")?,
                details: fields.dict("details")?,
                args: fields.list_opt("arguments")?,
                kwargs: fields.dict_opt("keyword arguments")?,
            },
            other => {
                return Err(WsError::InvalidMessage(format!(
                    "unsupported message code {other}"
                )));
            }
        };

        Ok(message)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn with_payload(mut fields: Vec<Value>, args: &[Value], kwargs: &Map<String, Value>) -> Vec<Value> {
    if !args.is_empty() || !kwargs.is_empty() {
        fields.push(json!(args));
    }
    if !kwargs.is_empty() {
        fields.push(json!(kwargs));
    }
    fields
}

struct Fields(std::vec::IntoIter<Value>);

impl Fields {
    fn next(&mut self, name: &str) -> Result<Value, WsError> {
        self.0
            .next()
            .ok_or_else(|| WsError::InvalidMessage(format!("missing {name}")))
    }

    fn id(&mut self, name: &str) -> Result<u64, WsError> {
        self.next(name)?
            .as_u64()
            .ok_or_else(|| WsError::InvalidMessage(format!("{name} must be an id")))
    }

    fn uri(&mut self, name: &str) -> Result<String, WsError> {
        match self.next(name)? {
            Value::String(s) => Ok(s),
            _ => Err(WsError::InvalidMessage(format!("{name} must be a URI"))),
        }
    }

    fn dict(&mut self, name: &str) -> Result<Map<String, Value>, WsError> {
        match self.next(name)? {
            Value::Object(map) => Ok(map),
            _ => Err(WsError::InvalidMessage(format!("{name} must be a dict"))),
        }
    }

    fn list_opt(&mut self, name: &str) -> Result<Vec<Value>, WsError> {
        match self.0.next() {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(WsError::InvalidMessage(format!("{name} must be a list"))),
        }
    }

    fn dict_opt(&mut self, name: &str) -> Result<Map<String, Value>, WsError> {
        match self.0.next() {
            None => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(WsError::InvalidMessage(format!("{name} must be a dict"))),
        }
    }
}
