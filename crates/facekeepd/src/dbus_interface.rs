use crate::engine::{EngineError, EngineHandle};
use zbus::interface;

pub const BUS_NAME: &str = "org.facekeep.Collector1";
pub const OBJECT_PATH: &str = "/org/facekeep/Collector1";

/// D-Bus control surface for the acquisition loop.
///
/// Bus name: org.facekeep.Collector1
/// Object path: /org/facekeep/Collector1
pub struct CollectorService {
    engine: EngineHandle,
}

impl CollectorService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn failed(e: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.facekeep.Collector1")]
impl CollectorService {
    /// Collect samples for `label`; replies once the record is stored.
    async fn collect(&self, label: &str) -> zbus::fdo::Result<String> {
        tracing::info!(label, "collect requested");
        let outcome = self.engine.collect(label).await.map_err(failed)?;
        to_json(&outcome)
    }

    /// Switch to recognition mode. Returns the number of indexed labels.
    async fn recognize(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("recognize requested");
        let labels = self.engine.recognize().await.map_err(failed)?;
        Ok(u32::try_from(labels).unwrap_or(u32::MAX))
    }

    /// Return to standby, cancelling any collection in progress.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        self.engine.stop().await.map_err(failed)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }

    async fn list_labels(&self) -> zbus::fdo::Result<String> {
        let labels = self.engine.list_labels().await.map_err(failed)?;
        to_json(&labels)
    }

    async fn remove_label(&self, label: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(label, "remove_label requested");
        match self.engine.remove_label(label).await {
            Ok(()) => Ok(true),
            Err(EngineError::Store(facekeep_core::StoreError::NotFound(_))) => Ok(false),
            Err(e) => Err(failed(e)),
        }
    }
}
