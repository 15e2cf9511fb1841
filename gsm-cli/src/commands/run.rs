//! `gsm run <manager>` - manager process entrypoints.

use gsm::config::Settings;
use gsm::lifecycle::LifecycleCoordinator;
use gsm::logging::init_logging;
use gsm::manager::{self, ModuleContext, ModuleError};
use gsm::signals::SignalHub;

use crate::error::CliError;
use crate::ManagerKind;

pub async fn run(manager: ManagerKind) -> Result<i32, CliError> {
    let settings = Settings::from_env().map_err(|e| CliError::Config(e.to_string()))?;
    let component = match manager {
        ManagerKind::Download => manager::download::MODULE,
        ManagerKind::Config => manager::config::MODULE,
        ManagerKind::Overlay => manager::overlay::MODULE,
        ManagerKind::Game => manager::game::MODULE,
        ManagerKind::Lifecycle => "lifecycleManager",
    };
    let _guard = init_logging(&settings.log_dir(), component)
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;
    gsm::panic::init(settings.lock_dir());

    if manager == ManagerKind::Lifecycle {
        let hub = SignalHub::install().map_err(|e| CliError::Config(e.to_string()))?;
        let coordinator = match LifecycleCoordinator::new(settings, hub) {
            Ok(coordinator) => coordinator,
            Err(code) => return Ok(code),
        };
        return Ok(coordinator.run().await);
    }

    let ctx = ModuleContext::initialize(component, settings)
        .map_err(|e| CliError::Config(e.to_string()))?;
    let runtime = match manager {
        ManagerKind::Download => manager::download::build(ctx),
        ManagerKind::Config => manager::config::build(ctx),
        ManagerKind::Overlay => manager::overlay::build(ctx),
        ManagerKind::Game => manager::game::build(ctx),
        ManagerKind::Lifecycle => unreachable!("handled above"),
    };

    match runtime.run().await {
        Ok(()) => Ok(0),
        Err(e @ ModuleError::SelfLock { .. }) => Err(CliError::ModuleLock(e.to_string())),
        Err(e) => Err(CliError::Config(e.to_string())),
    }
}
