//! Service lifecycle: link workers, the sample job and orderly shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldlink_core::{
    CommError, CommLink, CompleterTicket, Completion, Controller, FramedMessenger, LinkHandle,
    Messenger, ProtocolKind, StreamMessenger,
};
use fieldlink_protocols::gate_arm::ArmCommand;
use fieldlink_protocols::HdlcCodec;

use crate::config::ServiceConfig;
use crate::error::{PollSrvError, Result};
use crate::ops::{self, SampleSink, SampleStore};
use crate::scheduler::SampleJob;

/// Running link workers by link name
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: DashMap<String, LinkHandle>,
    /// Set while a controller has an event listen queued or running
    listening: DashMap<String, Arc<AtomicBool>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: LinkHandle) {
        let name = handle.name().to_string();
        if let Some(old) = self.links.insert(name.clone(), handle) {
            warn!(link = %name, "Replacing running worker");
            tokio::spawn(old.shutdown());
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    /// Operations waiting on `link`
    pub fn queued(&self, link: &str) -> Option<usize> {
        self.links.get(link).map(|h| h.queued())
    }

    /// Queue the interval sample for `controller` on its link
    pub fn submit_sample(
        &self,
        controller: &Arc<Controller>,
        mut ticket: CompleterTicket,
        sink: SampleSink,
    ) -> fieldlink_core::Result<()> {
        let link = match self.running(controller) {
            Ok(link) => link,
            Err(e) => {
                ticket.mark_failed();
                return Err(e);
            },
        };
        ops::submit_sample(&link, controller, ticket, sink)
    }

    /// Queue an event listen for a sensor controller
    ///
    /// Returns false when the link does not listen or the previous listen
    /// has not ended yet.
    pub fn submit_listen(
        &self,
        controller: &Arc<Controller>,
        store: &Arc<SampleStore>,
        cycles: u32,
    ) -> fieldlink_core::Result<bool> {
        let link = self.running(controller)?;
        if link.link().protocol != ProtocolKind::AsciiHex {
            return Ok(false);
        }
        let active = Arc::clone(
            self.listening
                .entry(controller.name().to_string())
                .or_default()
                .value(),
        );
        if active.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        ops::submit_listen(&link, controller, Arc::clone(store), active, cycles)?;
        Ok(true)
    }

    /// Queue an arm movement for a gate controller
    pub fn submit_gate_command(
        &self,
        controller: &Arc<Controller>,
        command: ArmCommand,
    ) -> fieldlink_core::Result<Completion<()>> {
        let link = self.running(controller)?;
        ops::submit_gate_command(&link, controller, command)
    }

    fn running(
        &self,
        controller: &Controller,
    ) -> fieldlink_core::Result<dashmap::mapref::one::Ref<'_, String, LinkHandle>> {
        self.links.get(controller.link()).ok_or_else(|| {
            CommError::config(format!("no running link '{}'", controller.link()))
        })
    }

    /// Stop every worker; queued operations are drained
    pub async fn shutdown(&self) -> usize {
        let names: Vec<String> = self.links.iter().map(|e| e.key().clone()).collect();
        let stops = names.into_iter().filter_map(|name| {
            self.links.remove(&name).map(|(_, handle)| async move {
                let drained = handle.shutdown().await;
                debug!(link = %name, "Worker stopped, {} operations drained", drained);
                drained
            })
        });
        join_all(stops).await.into_iter().sum()
    }
}

/// Transport for `link`, with the HDLC framer on sign links
pub fn build_messenger(link: &CommLink) -> Result<Box<dyn Messenger>> {
    let wrap = |source: CommError| PollSrvError::LinkError {
        link: link.name.clone(),
        source,
    };
    let stream = StreamMessenger::new(&link.name, &link.uri, link.timeout).map_err(wrap)?;
    if link.protocol == ProtocolKind::NtcipHdlc {
        let codec = match link.options.hdlc_address {
            Some(address) => HdlcCodec::with_address(address).map_err(wrap)?,
            None => HdlcCodec::new(),
        };
        return Ok(Box::new(FramedMessenger::new(Box::new(stream), codec)));
    }
    Ok(Box::new(stream))
}

/// Spawn one worker per configured link
///
/// A link whose transport cannot be built is logged and left out; its
/// controllers are then skipped by the sample job.
pub fn start_links(config: &ServiceConfig) -> LinkRegistry {
    let registry = LinkRegistry::new();
    let settings = config.engine.settings();
    let mut failed = 0;
    for link_config in &config.links {
        let link = link_config.to_comm_link(&config.engine);
        match build_messenger(&link) {
            Ok(messenger) if link.protocol == ProtocolKind::MemoryMapped => {
                registry.insert(LinkHandle::spawn_with_download(
                    link,
                    messenger,
                    settings.clone(),
                    ops::meter_download_hook(),
                ));
            },
            Ok(messenger) => {
                registry.insert(LinkHandle::spawn(link, messenger, settings.clone()));
            },
            Err(e) => {
                error!("Failed to start link: {}", e);
                failed += 1;
            },
        }
    }
    info!(
        "Link initialization completed: {} started, {} failed",
        registry.len(),
        failed
    );
    registry
}

/// Enabled controllers whose link is running
pub fn build_controllers(config: &ServiceConfig, registry: &LinkRegistry) -> Vec<Arc<Controller>> {
    config
        .controllers
        .iter()
        .filter(|c| c.enabled)
        .filter(|c| {
            let running = registry.contains(&c.link);
            if !running {
                warn!(controller = %c.name, "Link '{}' not running, controller skipped", c.link);
            }
            running
        })
        .map(|c| Arc::new(c.to_controller()))
        .collect()
}

/// A started polling service
pub struct PollService {
    registry: Arc<LinkRegistry>,
    controllers: Vec<Arc<Controller>>,
    store: Arc<SampleStore>,
    token: CancellationToken,
    job: JoinHandle<()>,
}

impl PollService {
    /// Start link workers and the sample job
    pub fn start(config: &ServiceConfig) -> Self {
        let registry = Arc::new(start_links(config));
        let controllers = build_controllers(config, &registry);
        info!(
            "Polling {} controllers on {} links",
            controllers.len(),
            registry.len()
        );
        Self::with_registry(
            registry,
            controllers,
            config.engine.sample_interval(),
            config.engine.listen_cycles,
        )
    }

    /// Start the sample job over already running workers
    pub fn with_registry(
        registry: Arc<LinkRegistry>,
        controllers: Vec<Arc<Controller>>,
        interval: std::time::Duration,
        listen_cycles: u32,
    ) -> Self {
        let store = Arc::new(SampleStore::new());
        let token = CancellationToken::new();
        let job = SampleJob::new(
            Arc::clone(&registry),
            controllers.clone(),
            Arc::clone(&store),
            interval,
        )
        .with_listen_cycles(listen_cycles)
        .spawn(token.clone());
        Self {
            registry,
            controllers,
            store,
            token,
            job,
        }
    }

    pub fn store(&self) -> &Arc<SampleStore> {
        &self.store
    }

    pub fn controllers(&self) -> &[Arc<Controller>] {
        &self.controllers
    }

    /// Move a gate arm by controller name
    pub fn gate_command(
        &self,
        controller: &str,
        command: ArmCommand,
    ) -> fieldlink_core::Result<Completion<()>> {
        let ctl = self
            .controllers
            .iter()
            .find(|c| c.name() == controller)
            .ok_or_else(|| CommError::config(format!("no controller '{controller}'")))?;
        self.registry.submit_gate_command(ctl, command)
    }

    /// Cancel the job, drain link queues and join the workers
    pub async fn shutdown(self) {
        info!("Starting graceful shutdown...");
        self.token.cancel();
        if let Err(e) = self.job.await {
            error!("Sample job failed: {}", e);
        }
        let drained = self.registry.shutdown().await;
        let failed = self.controllers.iter().filter(|c| c.is_failed()).count();
        info!(
            "Shutdown completed: {} queued operations drained, {} controllers failed",
            drained, failed
        );
    }
}
