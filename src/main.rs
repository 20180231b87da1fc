mod cli;
mod config;
mod discovery;
mod models;
mod mqtt_service;
mod poller;
mod samplers;
mod service_utils;
mod topics;

use crate::cli::Args;
use crate::config::Settings;
use crate::mqtt_service::{MqttConfig, MqttPublisher};
use crate::poller::Poller;
use crate::samplers::SystemSampler;
use crate::service_utils::{init_logging, shutdown_signal, start_mqtt_service};
use crate::topics::TopicBuilder;
use clap::Parser;
use std::process::ExitCode;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.create_config {
        init_logging("info");
        return match Settings::write_sample(&args.config) {
            Ok(()) => {
                info!("Sample configuration file created: {}", args.config.display());
                println!("Please edit {} with your MQTT broker details and run again.", args.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Failed to create sample config: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    // Load configuration
    let settings = match Settings::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            init_logging(if args.debug { "debug" } else { "info" });
            error!("Error loading configuration: {}", e);
            error!("Create a sample configuration file with: --create-config");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    init_logging(if args.debug { "debug" } else { settings.log_level.as_str() });

    let hostname = settings.resolve_hostname();
    let topics = TopicBuilder::new(&settings.topic_prefix, &settings.discovery_prefix, &hostname);

    let publisher = MqttPublisher::new(MqttConfig::from_settings(&settings, &topics));
    info!(
        "Publishing '{}' metrics to {}:{}",
        topics.node_id(),
        publisher.config.mqtt_host,
        publisher.config.mqtt_port
    );
    let connection = start_mqtt_service(publisher.clone());

    let sampler = SystemSampler::new(&settings);
    let poller = Poller::new(sampler, publisher.clone(), topics, &settings);
    let active: Vec<&str> = poller.metrics().iter().map(|m| m.key()).collect();
    info!("Active metrics: {}", active.join(", "));

    tokio::select! {
        _ = poller.run() => {}
        _ = shutdown_signal() => {}
    }

    publisher.shutdown().await;
    if timeout(Duration::from_secs(2), connection).await.is_err() {
        warn!("MQTT connection did not close in time");
    }

    info!("System monitor stopped");
    ExitCode::SUCCESS
}
