use serde_json::Value;

/// Turns argument values into strings and back.
///
/// Values travel through [`serde_json::Value`] so the serializer stays object
/// safe and can be swapped at runtime.
pub trait Serializer: Send + Sync + 'static {
    /// Serialize a value.
    fn serialize(&self, value: &Value) -> anyhow::Result<String>;

    /// Deserialize a string produced by [`Serializer::serialize`].
    fn deserialize(&self, raw: &str) -> anyhow::Result<Value>;
}

/// The default JSON serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> anyhow::Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize(&self, raw: &str) -> anyhow::Result<Value> {
        Ok(serde_json::from_str(raw)?)
    }
}
