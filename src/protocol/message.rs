use serde_json::{json, Map, Value};
use thiserror::Error;

/// Failure to turn bytes into a [`Message`]. Decoding never yields a
/// partially built message.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing key `{0}`")]
    MissingKey(&'static str),

    #[error("key `{key}` must be {expected}")]
    WrongType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("unknown target `{0}`")]
    UnknownTarget(String),
}

/// Role a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Client,
    Server,
    Console,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Client => "client",
            Target::Server => "server",
            Target::Console => "console",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client" => Some(Target::Client),
            "server" => Some(Target::Server),
            "console" => Some(Target::Console),
            _ => None,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Function,
    Relay,
    HealthCheck,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Function => "function",
            MessageKind::Relay => "relay",
            MessageKind::HealthCheck => "health_check",
            MessageKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(MessageKind::Function),
            "relay" => Some(MessageKind::Relay),
            "health_check" => Some(MessageKind::HealthCheck),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// Fields shared by every message kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub target: Target,
    /// Display name of the sender
    pub name: String,
    pub data: Value,
}

/// A named remote invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionMessage {
    pub target: Target,
    pub name: String,
    pub data: Value,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl FunctionMessage {
    pub fn new(target: Target, name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            target,
            name: name.into(),
            data: Value::Null,
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn to_value(&self) -> Value {
        json!({
            "type": MessageKind::Function.as_str(),
            "target": self.target.as_str(),
            "name": self.name,
            "data": self.data,
            "function": self.function,
            "args": self.args,
            "kwargs": self.kwargs,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        match Message::from_value(value)? {
            Message::Function(call) => Ok(call),
            other => Err(DecodeError::UnknownType(other.kind().as_str().to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Function(FunctionMessage),
    /// Server-only: `data` is `{"classifier": .., "message": ..}`
    Relay(Envelope),
    HealthCheck(Envelope),
    Error(Envelope),
}

impl From<FunctionMessage> for Message {
    fn from(call: FunctionMessage) -> Self {
        Message::Function(call)
    }
}

impl Message {
    /// Error message carrying a human readable description in `data`.
    pub fn error(target: Target, name: impl Into<String>, text: impl Into<String>) -> Self {
        Message::Error(Envelope {
            target,
            name: name.into(),
            data: json!({ "error": text.into() }),
        })
    }

    pub fn health_check(target: Target, name: impl Into<String>) -> Self {
        Message::HealthCheck(Envelope {
            target,
            name: name.into(),
            data: Value::Null,
        })
    }

    /// Wrap `message` for the coordinator to forward to every client whose
    /// name matches `classifier`.
    pub fn relay(name: impl Into<String>, classifier: &str, message: &Message) -> Self {
        Message::Relay(Envelope {
            target: Target::Server,
            name: name.into(),
            data: json!({ "classifier": classifier, "message": message.to_value() }),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Function(_) => MessageKind::Function,
            Message::Relay(_) => MessageKind::Relay,
            Message::HealthCheck(_) => MessageKind::HealthCheck,
            Message::Error(_) => MessageKind::Error,
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Message::Function(call) => call.target,
            Message::Relay(env) | Message::HealthCheck(env) | Message::Error(env) => env.target,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Message::Function(call) => &call.name,
            Message::Relay(env) | Message::HealthCheck(env) | Message::Error(env) => &env.name,
        }
    }

    pub fn data(&self) -> &Value {
        match self {
            Message::Function(call) => &call.data,
            Message::Relay(env) | Message::HealthCheck(env) | Message::Error(env) => &env.data,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Message::Function(call) => call.to_value(),
            Message::Relay(env) | Message::HealthCheck(env) | Message::Error(env) => json!({
                "type": self.kind().as_str(),
                "target": env.target.as_str(),
                "name": env.name,
                "data": env.data,
            }),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let kind = take_string(&mut obj, "type")?;
        let kind = MessageKind::parse(&kind).ok_or(DecodeError::UnknownType(kind))?;
        let target = take_string(&mut obj, "target")?;
        let target = Target::parse(&target).ok_or(DecodeError::UnknownTarget(target))?;
        let name = take_string(&mut obj, "name")?;
        let data = obj.remove("data").ok_or(DecodeError::MissingKey("data"))?;

        let envelope = Envelope { target, name, data };
        match kind {
            MessageKind::Function => {
                let function = take_string(&mut obj, "function")?;
                let args = match obj.remove("args") {
                    Some(Value::Array(args)) => args,
                    Some(_) => {
                        return Err(DecodeError::WrongType {
                            key: "args",
                            expected: "an array",
                        })
                    }
                    None => return Err(DecodeError::MissingKey("args")),
                };
                let kwargs = match obj.remove("kwargs") {
                    Some(Value::Object(kwargs)) => kwargs,
                    Some(_) => {
                        return Err(DecodeError::WrongType {
                            key: "kwargs",
                            expected: "an object",
                        })
                    }
                    None => return Err(DecodeError::MissingKey("kwargs")),
                };
                Ok(Message::Function(FunctionMessage {
                    target: envelope.target,
                    name: envelope.name,
                    data: envelope.data,
                    function,
                    args,
                    kwargs,
                }))
            }
            MessageKind::Relay => Ok(Message::Relay(envelope)),
            MessageKind::HealthCheck => Ok(Message::HealthCheck(envelope)),
            MessageKind::Error => Ok(Message::Error(envelope)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_text().into_bytes()
    }

    pub fn encode_text(&self) -> String {
        self.to_value().to_string()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }
}

fn take_string(obj: &mut Map<String, Value>, key: &'static str) -> Result<String, DecodeError> {
    match obj.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(DecodeError::WrongType {
            key,
            expected: "a string",
        }),
        None => Err(DecodeError::MissingKey(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_message_round_trip() {
        let msg: Message = FunctionMessage::new(Target::Server, "render01", "fail_task")
            .arg(42)
            .arg("out of memory")
            .kwarg("retry", true)
            .into();

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);

        let Message::Function(call) = decoded else {
            panic!("expected a function message");
        };
        assert_eq!(call.function, "fail_task");
        assert_eq!(call.args, vec![json!(42), json!("out of memory")]);
        assert_eq!(call.kwargs.get("retry"), Some(&json!(true)));
        assert_eq!(call.target, Target::Server);
    }

    #[test]
    fn encoded_function_message_has_wire_keys() {
        let msg: Message = FunctionMessage::new(Target::Client, "server", "shell").into();
        let value: Value = serde_json::from_slice(&msg.encode()).unwrap();
        let obj = value.as_object().unwrap();
        for key in ["type", "target", "name", "data", "function", "args", "kwargs"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj["type"], "function");
        assert_eq!(obj["target"], "client");
    }

    #[test]
    fn plain_messages_round_trip() {
        for msg in [
            Message::error(Target::Console, "render01", "boom"),
            Message::health_check(Target::Server, "console-1"),
            Message::relay(
                "console-1",
                "render*",
                &FunctionMessage::new(Target::Client, "console-1", "stop").into(),
            ),
        ] {
            let decoded = Message::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(decoded.kind(), msg.kind());
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let raw = br#"{"type":"telepathy","target":"server","name":"a","data":null}"#;
        assert!(matches!(
            Message::decode(raw),
            Err(DecodeError::UnknownType(t)) if t == "telepathy"
        ));
    }

    #[test]
    fn decode_rejects_missing_keys() {
        let raw = br#"{"type":"error","target":"server","data":null}"#;
        assert!(matches!(
            Message::decode(raw),
            Err(DecodeError::MissingKey("name"))
        ));

        let raw = br#"{"type":"function","target":"server","name":"a","data":null,"function":"f","args":[]}"#;
        assert!(matches!(
            Message::decode(raw),
            Err(DecodeError::MissingKey("kwargs"))
        ));
    }

    #[test]
    fn decode_rejects_bad_shapes() {
        assert!(matches!(
            Message::decode(b"[1,2,3]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            Message::decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
        let raw = br#"{"type":"function","target":"server","name":"a","data":null,"function":"f","args":{},"kwargs":{}}"#;
        assert!(matches!(
            Message::decode(raw),
            Err(DecodeError::WrongType { key: "args", .. })
        ));
        let raw = br#"{"type":"error","target":"gpu","name":"a","data":null}"#;
        assert!(matches!(
            Message::decode(raw),
            Err(DecodeError::UnknownTarget(t)) if t == "gpu"
        ));
    }

    #[test]
    fn function_message_from_value_rejects_other_kinds() {
        let value = Message::error(Target::Console, "a", "b").to_value();
        assert!(FunctionMessage::from_value(value).is_err());
    }
}
