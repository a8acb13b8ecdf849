//! Shard supervision and identify concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use super::error::GatewayError;
use super::shard::{Shard, ShardEvent};
use crate::config::ShardManagerOptions;
use crate::dispatcher::{Dispatcher, HandlerResult};
use crate::http::{Authentication, HttpEngine, HttpError};
use crate::times_per::TimesPerWindow;
use crate::types::GatewayPayload;

/// One IDENTIFY per identify bucket per this long.
const IDENTIFY_WINDOW: Duration = Duration::from_secs(5);

/// Failures from [`ShardManager::connect`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Fetching `/gateway/bot` failed.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The shard configuration or lifecycle was invalid.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Spawns and supervises a set of [`Shard`]s.
///
/// Per-shard dispatchers are aggregated: every shard's raw frames, DISPATCH
/// events, and `critical` failures are relayed onto the manager-level
/// dispatchers. A fatal shard error is re-emitted on `critical` and the
/// shard is not restarted.
#[derive(Debug)]
pub struct ShardManager {
    options: ShardManagerOptions,
    engine: Arc<HttpEngine>,
    shards: Mutex<Vec<Arc<Shard>>>,
    raw_dispatcher: Dispatcher<u8, GatewayPayload>,
    event_dispatcher: Dispatcher<String, Value>,
    dispatcher: Dispatcher<String, ShardEvent>,
    identify_gates: Mutex<HashMap<u16, Arc<TimesPerWindow>>>,
    max_concurrency: Mutex<Option<u16>>,
}

impl ShardManager {
    /// Create a manager.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardConfig`] when `shard_ids` is given
    /// without `shard_count`.
    pub fn new(options: ShardManagerOptions, engine: Arc<HttpEngine>) -> Result<Self, GatewayError> {
        if options.shard_ids.is_some() && options.shard_count.is_none() {
            return Err(GatewayError::ShardConfig(
                "shard_ids requires shard_count".to_owned(),
            ));
        }
        Ok(Self {
            options,
            engine,
            shards: Mutex::new(Vec::new()),
            raw_dispatcher: Dispatcher::new(),
            event_dispatcher: Dispatcher::new(),
            dispatcher: Dispatcher::new(),
            identify_gates: Mutex::new(HashMap::new()),
            max_concurrency: Mutex::new(None),
        })
    }

    /// Aggregated raw frames from every shard, keyed by opcode.
    #[must_use]
    pub fn raw_dispatcher(&self) -> &Dispatcher<u8, GatewayPayload> {
        &self.raw_dispatcher
    }

    /// Aggregated DISPATCH events from every shard, keyed by event name.
    #[must_use]
    pub fn event_dispatcher(&self) -> &Dispatcher<String, Value> {
        &self.event_dispatcher
    }

    /// Manager-level events; `critical` carries fatal shard errors.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher<String, ShardEvent> {
        &self.dispatcher
    }

    /// The shards spawned by [`Self::connect`].
    #[must_use]
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.lock().clone()
    }

    /// IDENTIFY concurrency reported by `/gateway/bot`, once connected.
    #[must_use]
    pub fn max_concurrency(&self) -> Option<u16> {
        *self.max_concurrency.lock()
    }

    /// Fetch connection info and start every shard.
    ///
    /// Returns once all shards have begun connecting, not once they are
    /// READY.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::AlreadyConnected`] on a second call.
    /// - [`HttpError`] when `/gateway/bot` cannot be fetched.
    /// - [`GatewayError::ShardConfig`] for inconsistent shard ids.
    pub async fn connect(&self) -> Result<(), ManagerError> {
        if !self.shards.lock().is_empty() {
            return Err(GatewayError::AlreadyConnected.into());
        }

        let auth = Authentication::Bot(self.options.token.clone());
        let info = self.engine.get_gateway_bot(&auth).await?;
        let max_concurrency = info.session_start_limit.max_concurrency.max(1);
        *self.max_concurrency.lock() = Some(max_concurrency);

        let shard_count = self.options.shard_count.unwrap_or(info.shards).max(1);
        let shard_ids = self
            .options
            .shard_ids
            .clone()
            .unwrap_or_else(|| (0..shard_count).collect());
        if let Some(bad) = shard_ids.iter().find(|id| **id >= shard_count) {
            return Err(GatewayError::ShardConfig(format!(
                "shard id {bad} is out of range for shard count {shard_count}"
            ))
            .into());
        }

        let mut shards = Vec::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            let gate = {
                let mut gates = self.identify_gates.lock();
                Arc::clone(
                    gates
                        .entry(shard_id % max_concurrency)
                        .or_insert_with(|| Arc::new(TimesPerWindow::new(1, IDENTIFY_WINDOW))),
                )
            };
            let shard = Arc::new(Shard::new(
                shard_id,
                shard_count,
                info.url.clone(),
                &self.options,
                gate,
            ));
            self.wire_relays(&shard);
            shard.connect()?;
            debug!(shard_id, "spawned shard");
            shards.push(shard);
        }

        info!(
            count = shards.len(),
            shard_count, max_concurrency, "all shards connecting"
        );
        *self.shards.lock() = shards;
        Ok(())
    }

    /// Close every shard without keeping the sessions.
    pub async fn close(&self) {
        let shards = self.shards();
        debug!(count = shards.len(), "closing shards");
        for shard in shards {
            shard.close(false).await;
        }
    }

    fn wire_relays(&self, shard: &Arc<Shard>) {
        let raw = self.raw_dispatcher.clone();
        shard.raw_dispatcher().add_global_listener(move |op, frame| {
            let raw = raw.clone();
            async move {
                raw.dispatch(op, frame).await;
                HandlerResult::Ok(())
            }
        });

        let events = self.event_dispatcher.clone();
        shard
            .event_dispatcher()
            .add_global_listener(move |name, data| {
                let events = events.clone();
                async move {
                    events.dispatch(name, data).await;
                    HandlerResult::Ok(())
                }
            });

        let meta = self.dispatcher.clone();
        shard
            .dispatcher()
            .add_listener("critical".to_owned(), move |event| {
                let meta = meta.clone();
                async move {
                    meta.dispatch("critical".to_owned(), event).await;
                    HandlerResult::Ok(())
                }
            });
    }
}
