//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `warden_core` linkage.
//! - Wire a tiny component graph out of order and print what resolves.
//! - Keep output deterministic for quick local sanity checks.

use log::info;
use std::process::ExitCode;
use std::sync::Arc;
use warden_core::{
    init_logging, instance, DependencySpec, FnActivator, KernelConfig, KernelResult, Lifestyle,
    Registry, RegistrationRecord,
};

struct Greeter {
    prefix: Arc<String>,
}

fn wire(registry: &Registry) -> KernelResult<()> {
    // Registered before its dependency: waits until `prefix` arrives.
    registry.register_record(
        RegistrationRecord::new("greeter", "Greeter")
            .lifestyle(Lifestyle::Transient)
            .depends_on(DependencySpec::required("prefix")),
        FnActivator::new(|deps| {
            let prefix = deps.required::<String>("prefix")?;
            Ok(instance(Greeter { prefix }))
        }),
    )?;
    println!(
        "warden_core greeter_state={}",
        registry
            .handler_state("greeter")
            .map(|state| state.as_str())
            .unwrap_or("missing")
    );

    registry.register_record(
        RegistrationRecord::new("prefix", "Prefix"),
        FnActivator::new(|_| Ok(instance(String::from("hello")))),
    )?;
    println!(
        "warden_core greeter_state={}",
        registry
            .handler_state("greeter")
            .map(|state| state.as_str())
            .unwrap_or("missing")
    );

    let greeter = registry.resolve_as::<Greeter>("greeter")?;
    println!("warden_core greeting={} world", greeter.prefix);
    println!("warden_core tracked={}", registry.tracked_count());
    registry.release(&greeter);
    println!("warden_core tracked={}", registry.tracked_count());
    Ok(())
}

fn main() -> ExitCode {
    let config = KernelConfig::default();
    if let Err(err) = init_logging(&config.logging) {
        eprintln!("warden_core logging_error={err}");
    }

    println!("warden_core version={}", warden_core::core_version());
    let registry = Registry::with_config(config);
    let result = wire(&registry);
    registry.dispose();
    info!("event=cli_exit module=cli status={}", if result.is_ok() { "ok" } else { "error" });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("warden_core error={err}");
            ExitCode::FAILURE
        }
    }
}
