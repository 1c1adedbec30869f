//! Configuration validation
//!
//! Fail-fast validation of configuration invariants.

use super::Config;
use anyhow::{bail, Result};

/// Validate configuration invariants
pub fn validate(config: &Config) -> Result<()> {
    validate_names(config)?;
    validate_ports(config)?;
    validate_controller(config)?;
    validate_agent(config)?;
    Ok(())
}

fn validate_names(config: &Config) -> Result<()> {
    if config.api_group.is_empty() {
        bail!("api_group cannot be empty");
    }

    let names = &config.names;
    let templates = [
        ("names.deployment", &names.deployment),
        ("names.secret", &names.secret),
        ("names.service", &names.service),
        ("names.metrics_service", &names.metrics_service),
        ("names.role", &names.role),
        ("names.service_account", &names.service_account),
        ("names.config_map", &names.config_map),
        ("names.authorized_clients", &names.authorized_clients),
        ("names.control_secret", &names.control_secret),
        ("names.backend", &names.backend),
    ];
    for (field, template) in templates {
        if !template.contains("{name}") {
            bail!("{} must contain {{name}} (got {:?})", field, template);
        }
        if template.contains('/') {
            bail!("{} cannot contain '/'", field);
        }
    }
    if !names.backend.contains("{index}") {
        bail!("names.backend must contain {{index}} (got {:?})", names.backend);
    }

    Ok(())
}

fn validate_ports(config: &Config) -> Result<()> {
    let ports = &config.ports;
    if ports.control == 0 || ports.metrics == 0 || ports.balancer_control == 0 {
        bail!("ports.control, ports.metrics and ports.balancer_control cannot be 0");
    }
    // SOCKS may be disabled with 0, otherwise it must not collide
    if ports.socks != 0 && (ports.socks == ports.control || ports.socks == ports.metrics) {
        bail!("ports.socks ({}) collides with another daemon port", ports.socks);
    }
    if ports.control == ports.metrics {
        bail!(
            "ports.control ({}) and ports.metrics ({}) must differ",
            ports.control,
            ports.metrics
        );
    }
    if ports.metrics_policy.contains('\n') {
        bail!("ports.metrics_policy must be a single line");
    }
    Ok(())
}

fn validate_controller(config: &Config) -> Result<()> {
    let controller = &config.controller;
    if controller.workers == 0 {
        bail!("controller.workers must be at least 1");
    }
    if controller.max_retries == 0 {
        bail!("controller.max_retries must be at least 1");
    }
    if controller.convergence_requeue_secs == 0 {
        bail!("controller.convergence_requeue_secs must be greater than 0");
    }
    Ok(())
}

fn validate_agent(config: &Config) -> Result<()> {
    let agent = &config.agent;
    if agent.tor.program.is_empty() {
        bail!("agent.tor.program cannot be empty");
    }
    if agent.balancer.program.is_empty() {
        bail!("agent.balancer.program cannot be empty");
    }
    if agent.key_dir == agent.service_dir {
        bail!("agent.key_dir must differ from agent.service_dir");
    }
    Ok(())
}
