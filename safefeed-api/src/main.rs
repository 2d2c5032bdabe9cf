use axum::extract::DefaultBodyLimit;
use safefeed_classifier::{
    ClassifierConfig, DecisionRule, DecisionRuleKind, ErrorPolicy, ImageClassifier,
};
use safefeed_common::{
    snowflake::{ProcessId, WorkerId},
    util::PositiveDuration,
};
use safefeed_db::client::{DbClient, DbError};
use serde::Deserialize;
use server::{AuthConfig, ServerState};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod server;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
enum InitError {
    #[error("Error parsing .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("Error parsing environment: {0}")]
    Envy(#[from] envy::Error),
    #[error("NSFW_THRESHOLD must be in (0, 1], got {0}")]
    InvalidThreshold(f32),
    #[error("TOKEN_LIFETIME_HOURS must be positive")]
    InvalidTokenLifetime,
    #[error("Error setting up the database: {0}")]
    Database(#[from] DbError),
    #[error("Error binding tcp listener: {0}")]
    TcpBind(std::io::Error),
    #[error("Error serving server: {0}")]
    TcpServe(std::io::Error),
}

fn default_nsfw_threshold() -> f32 {
    0.5
}

fn default_max_upload_bytes() -> usize {
    DEFAULT_MAX_UPLOAD_BYTES
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
struct Env {
    server_address: IpAddr,
    server_port: u16,
    database_url: String,
    model_path: PathBuf,
    #[serde(default)]
    worker_id: WorkerId,
    #[serde(default)]
    process_id: ProcessId,
    #[serde(default)]
    on_classifier_error: ErrorPolicy,
    #[serde(default)]
    nsfw_decision_rule: DecisionRuleKind,
    #[serde(default = "default_nsfw_threshold")]
    nsfw_threshold: f32,
    #[serde(default = "default_max_upload_bytes")]
    max_upload_bytes: usize,
    token_lifetime_hours: Option<i64>,
}

impl Env {
    fn classifier_config(&self) -> Result<ClassifierConfig, InitError> {
        if !(self.nsfw_threshold > 0.0 && self.nsfw_threshold <= 1.0) {
            return Err(InitError::InvalidThreshold(self.nsfw_threshold));
        }

        Ok(ClassifierConfig {
            decision_rule: DecisionRule::from_kind(self.nsfw_decision_rule, self.nsfw_threshold),
            on_error: self.on_classifier_error,
        })
    }

    fn auth_config(&self) -> Result<AuthConfig, InitError> {
        let token_lifetime = self
            .token_lifetime_hours
            .map(|hours| PositiveDuration::new(Duration::hours(hours)))
            .map(|lifetime| lifetime.ok_or(InitError::InvalidTokenLifetime))
            .transpose()?;

        Ok(AuthConfig { token_lifetime })
    }
}

fn install_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "safefeed_api=debug,\
                safefeed_db=debug,\
                safefeed_classifier=debug,\
                tower_http=debug,axum::rejection=trace,sqlx=warn"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn get_env() -> Result<Env, InitError> {
    if let Err(e) = dotenvy::dotenv() {
        if e.not_found() {
            debug!("No .dotenv file found");
        } else {
            return Err(e.into());
        }
    }

    envy::from_env().map_err(InitError::from)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), InitError> {
    install_tracing();
    let env = get_env()?;

    let db_client = DbClient::connect(&env.database_url, env.worker_id, env.process_id).await?;
    // The model itself is only read on the first classified image.
    let classifier =
        ImageClassifier::from_onnx_file(env.classifier_config()?, env.model_path.clone());

    let state = ServerState {
        db_client: Arc::new(db_client),
        classifier: Arc::new(classifier),
        auth_config: env.auth_config()?,
    };

    let tracing_layer = TraceLayer::new_for_http();
    let app = server::routes()
        .layer(DefaultBodyLimit::max(env.max_upload_bytes))
        .layer(tracing_layer)
        .with_state(state);

    let server_address = SocketAddr::new(env.server_address, env.server_port);
    let listener = tokio::net::TcpListener::bind(server_address)
        .await
        .map_err(InitError::TcpBind)?;
    info!(%server_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(InitError::TcpServe)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{Env, InitError};
    use safefeed_classifier::{DecisionRule, DecisionRuleKind, ErrorPolicy};
    use safefeed_common::snowflake::{ProcessId, WorkerId};
    use std::path::PathBuf;

    fn env() -> Env {
        Env {
            server_address: [127, 0, 0, 1].into(),
            server_port: 8080,
            database_url: "sqlite::memory:".to_owned(),
            model_path: PathBuf::from("model.onnx"),
            worker_id: WorkerId::default(),
            process_id: ProcessId::default(),
            on_classifier_error: ErrorPolicy::Allow,
            nsfw_decision_rule: DecisionRuleKind::NsfwProbability,
            nsfw_threshold: 0.7,
            max_upload_bytes: 1024,
            token_lifetime_hours: None,
        }
    }

    #[test]
    fn classifier_config() {
        let config = env().classifier_config().unwrap();
        assert_eq!(
            config.decision_rule,
            DecisionRule::NsfwProbability { threshold: 0.7 }
        );

        let out_of_range = Env {
            nsfw_threshold: 1.5,
            ..env()
        };
        assert!(matches!(
            out_of_range.classifier_config(),
            Err(InitError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn token_lifetime() {
        assert_eq!(env().auth_config().unwrap().token_lifetime, None);

        let day = Env {
            token_lifetime_hours: Some(24),
            ..env()
        };
        assert_eq!(
            day.auth_config()
                .unwrap()
                .token_lifetime
                .unwrap()
                .whole_seconds(),
            24 * 60 * 60
        );

        let zero = Env {
            token_lifetime_hours: Some(0),
            ..env()
        };
        assert!(matches!(
            zero.auth_config(),
            Err(InitError::InvalidTokenLifetime)
        ));
    }

    #[test]
    fn env_from_variables() {
        let vars = [
            ("SERVER_ADDRESS", "0.0.0.0"),
            ("SERVER_PORT", "3000"),
            ("DATABASE_URL", "sqlite://safefeed.db"),
            ("MODEL_PATH", "/models/nsfw.onnx"),
            ("ON_CLASSIFIER_ERROR", "block"),
            ("NSFW_DECISION_RULE", "nsfw_probability"),
        ]
        .map(|(key, value)| (key.to_owned(), value.to_owned()));

        let env: Env = envy::from_iter(vars).unwrap();

        assert_eq!(env.server_port, 3000);
        assert_eq!(env.on_classifier_error, ErrorPolicy::Block);
        assert_eq!(env.nsfw_decision_rule, DecisionRuleKind::NsfwProbability);
        assert!((env.nsfw_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(env.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(env.worker_id.get(), 0);
        assert_eq!(env.token_lifetime_hours, None);
    }
}
