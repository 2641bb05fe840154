//! 設定マッピング定義
//!
//! ランナーに紐付く既定リクエストパラメータのセット。リクエストボディが
//! 明示しないフィールドのみ補完し、クライアントの指定は上書きしない。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Named set of default request parameters, attached to runners by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Configuration ID
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Display name
    pub name: String,
    /// Default model substituted when the request omits one
    #[serde(default)]
    pub model: Option<String>,
    /// Default body fields (e.g. `temperature`, `options`) filled in
    /// when absent from the request
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

impl Configuration {
    /// Fills missing body fields with this configuration's defaults.
    ///
    /// Fields the client set explicitly are never overridden, and
    /// non-object bodies are left untouched.
    pub fn apply(&self, body: &mut Value) {
        let Value::Object(map) = body else { return };
        if let Some(model) = &self.model {
            map.entry("model")
                .or_insert_with(|| Value::String(model.clone()));
        }
        for (key, value) in &self.parameters {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}
