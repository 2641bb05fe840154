//! LLM Gateway Server
//!
//! 複数のLLM推論エンドポイントを仮想ベースパス配下に集約する
//! マルチテナントゲートウェイ

#![warn(missing_docs)]

/// 共通型定義・エラー型
pub mod common;

/// REST APIハンドラー
pub mod api;

/// プロトコルアダプター（OpenAI方言 / Ollama方言）
pub mod adapters;

/// セッションアフィニティテーブル
pub mod affinity;

/// ロードバランサー（重み付きラウンドロビン等）とアドミッション制御
pub mod balancer;

/// ディスパッチャー（リクエストの解決・転送・フェイルオーバー）
pub mod dispatch;

/// ヘルスチェック監視
pub mod health;

/// リクエスト履歴レコーダー
pub mod history;

/// リポジトリ抽象化（テナントスコープCRUD）
pub mod repo;

/// 仮想モデルランナーレジストリ
pub mod registry;

/// ロギング初期化ユーティリティ
pub mod logging;

/// 設定管理（環境変数ヘルパー・シードファイル）
pub mod config;

/// axumサーバー起動・シャットダウン
pub mod server;

/// 型定義
pub mod types;

use std::sync::Arc;

/// アプリケーション状態
#[derive(Clone)]
pub struct AppState {
    /// ディスパッチャー
    pub dispatcher: Arc<dispatch::Dispatcher>,
    /// ヘルスモニター
    pub monitor: Arc<health::HealthMonitor>,
    /// ランナーレジストリ
    pub registry: registry::RunnerRegistry,
    /// 共有HTTPクライアント（接続プーリング有効）
    pub http_client: reqwest::Client,
}
