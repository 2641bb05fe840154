//! 共通モジュール
//!
//! エラー型・共通ユーティリティ

pub mod error;

pub use error::{GatewayError, GatewayResult, OpenAIErrorDetail, OpenAIErrorResponse};
