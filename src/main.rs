//! WiFi agent firmware binary.
//!
//! On ESP32 the radio is driven through ESP-IDF; on a host the simulated
//! radio stands in so the control channel can be exercised end to end.
//!
//! # Usage
//!
//! ```bash
//! # Host
//! AGENT_PORT=9000 AGENT_UPLOAD_DIR=/tmp/uploads cargo run --bin agent
//!
//! # ESP32
//! cargo build --release --features esp32 --target xtensa-esp32-espidf
//! ```

use log::{error, info, warn};
use wifi_agent_esp32::config::{AgentConfig, ConfigStore};
use wifi_agent_esp32::discovery::DiscoveryResponder;
use wifi_agent_esp32::platform::Platform;
use wifi_agent_esp32::server::{AgentContext, CommandServer, TcpBinder};
use wifi_agent_esp32::wifi::{NetworkInterface, WifiManager};

#[cfg(feature = "esp32")]
fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();

    // Initialize ESP-IDF logger for log crate integration
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("=== WiFi agent starting ===");

    let peripherals = match esp_idf_hal::peripherals::Peripherals::take() {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to take peripherals: {:?}", e);
            return;
        }
    };
    let sysloop = match esp_idf_svc::eventloop::EspSystemEventLoop::take() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to take system event loop: {:?}", e);
            return;
        }
    };
    let nvs = match esp_idf_svc::nvs::EspDefaultNvsPartition::take() {
        Ok(nvs) => Some(nvs),
        Err(e) => {
            warn!("NVS unavailable, radio calibration will not persist: {:?}", e);
            None
        }
    };

    let radio = match wifi_agent_esp32::wifi::EspRadio::new(peripherals.modem, sysloop, nvs) {
        Ok(radio) => radio,
        Err(e) => {
            error!("Failed to initialize WiFi driver: {:?}", e);
            return;
        }
    };
    let (sta, ap) = radio.split();

    if let Err(e) = wifi_agent_esp32::platform::mount_storage() {
        error!("Failed to mount storage, settings will not persist: {:?}", e);
    }
    let config = AgentConfig::from_env().rooted_at(wifi_agent_esp32::platform::STORAGE_ROOT);

    run(
        config,
        sta,
        ap,
        wifi_agent_esp32::platform::EspPlatform::new(),
    );
}

#[cfg(not(feature = "esp32"))]
fn main() {
    use wifi_agent_esp32::platform::HostPlatform;
    use wifi_agent_esp32::wifi::SimulatedInterface;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== WiFi agent starting (host, simulated radio) ===");

    run(
        AgentConfig::from_env(),
        SimulatedInterface::station(),
        SimulatedInterface::access_point(),
        HostPlatform::new(),
    );
}

fn run<S, A, P>(config: AgentConfig, sta: S, ap: A, platform: P)
where
    S: NetworkInterface,
    A: NetworkInterface,
    P: Platform,
{
    info!("Configuration: {:?}", config);

    let store = ConfigStore::open(&config.config_path, config.persist);
    let wifi = WifiManager::new(sta, ap).with_max_association_wait(config.max_association_wait);
    let mut ctx = AgentContext::new(store, wifi, platform, &config.upload_dir);
    ctx.boot();

    let server = match CommandServer::bind(ctx, TcpBinder::any(), config.port) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start control channel: {}", e);
            std::process::exit(1);
        }
    };

    // Keep responder alive - variable intentionally unused except for Drop
    let _discovery = if config.discovery {
        match DiscoveryResponder::start(server.port()) {
            Ok(responder) => Some(responder),
            Err(e) => {
                warn!("Failed to start discovery responder: {}", e);
                warn!("Continuing without discovery");
                None
            }
        }
    } else {
        None
    };

    match server.serve() {
        Ok(_) => info!("Agent stopped"),
        Err(e) => {
            error!("Control channel failed: {}", e);
            std::process::exit(1);
        }
    }
}
