//! Everything a connection needs, built once at startup.

use std::sync::Arc;

use crate::{
    catalog::Catalog,
    config::Config,
    connections::ConnectionRegistry,
    error::Result,
    handshake::BootloaderHandshake,
    registry::DeviceRegistry,
    tool::Toolchain,
    tracing::prelude::*,
    transport::{Detector, NullDetector, UsbDetector},
};

pub struct AppContext {
    pub config: Config,
    pub registry: Arc<DeviceRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub handshake: Arc<BootloaderHandshake>,
}

impl AppContext {
    /// Load the catalog, pick a detector and register the simulated boards.
    pub fn from_config(config: Config) -> Result<Self> {
        let catalog = Arc::new(Catalog::load(config.device_list.as_deref())?);
        info!(templates = catalog.len(), "Board catalog loaded");

        let detector: Arc<dyn Detector> = if config.usb_disable {
            info!("USB detection disabled");
            Arc::new(NullDetector)
        } else {
            Arc::new(UsbDetector::new(catalog.clone()))
        };

        let tools = Arc::new(Toolchain::from_config(&config));
        let handshake = Arc::new(BootloaderHandshake::default());
        Ok(Self::with_parts(config, catalog, detector, tools, handshake))
    }

    pub fn with_parts(
        config: Config,
        catalog: Arc<Catalog>,
        detector: Arc<dyn Detector>,
        tools: Arc<Toolchain>,
        handshake: Arc<BootloaderHandshake>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new(catalog, detector, tools));
        registry.add_simulated(
            config.simulated_boards,
            config.simulated_ms1,
            config.simulated_flash_duration(),
        );
        Self {
            config,
            registry,
            connections: Arc::new(ConnectionRegistry::new()),
            handshake,
        }
    }

    /// Firmware blocks are as large as a websocket message may be.
    pub fn block_size(&self) -> usize {
        self.config.max_msg_size
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::handshake::HandshakeConfig;
    use crate::registry::testing::ScriptedDetector;
    use crate::tool::testing::{toolchain, ScriptedTool};
    use crate::transport::TouchReboot;

    /// Context over scripted hardware and succeeding tools.
    pub fn context(config: Config, detector: Arc<ScriptedDetector>) -> Arc<AppContext> {
        Arc::new(AppContext::with_parts(
            config,
            Arc::new(Catalog::builtin().unwrap()),
            detector,
            Arc::new(toolchain(
                Arc::new(ScriptedTool::succeeding()),
                Arc::new(ScriptedTool::succeeding()),
            )),
            Arc::new(BootloaderHandshake::new(
                Arc::new(TouchReboot),
                HandshakeConfig::default(),
            )),
        ))
    }

    pub fn simulated_config(boards: usize, ms1: usize) -> Config {
        Config {
            simulated_boards: boards,
            simulated_ms1: ms1,
            simulated_flash_ms: 300,
            usb_disable: true,
            ..Config::default()
        }
    }
}
