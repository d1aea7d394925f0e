use parking_lot::Mutex;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use warden_core::{
    instance, ActivationError, ComponentDescriptor, DependencySpec, FnActivator, HandlerState,
    Instance, KernelConfig, KernelError, KernelEvent, Lifestyle, RecordValidationError, Registry,
    RegistrationRecord, SelectionPolicy, SubDependencyResolver,
};

fn named(value: &'static str) -> FnActivator {
    FnActivator::new(move |_| Ok(instance(value.to_string())))
}

fn transient(key: &str) -> RegistrationRecord {
    RegistrationRecord::new(key, "Component").lifestyle(Lifestyle::Transient)
}

fn as_string(value: &Instance) -> String {
    value
        .clone()
        .downcast::<String>()
        .map(|text| text.as_str().to_string())
        .expect("string instance")
}

struct FixedSetting;

impl SubDependencyResolver for FixedSetting {
    fn can_resolve(&self, _descriptor: &ComponentDescriptor, dependency: &DependencySpec) -> bool {
        dependency.service == "setting"
    }

    fn resolve(
        &self,
        descriptor: &ComponentDescriptor,
        _dependency: &DependencySpec,
    ) -> Result<Instance, ActivationError> {
        Ok(instance(format!("setting for {}", descriptor.key())))
    }
}

#[test]
fn sub_resolver_validates_and_supplies_dependencies() {
    let registry = Registry::new();
    registry
        .register_record(
            transient("mailer").depends_on(DependencySpec::required("setting")),
            FnActivator::new(|deps| {
                let setting = deps.required::<String>("setting")?;
                Ok(instance(format!("mailer with {setting}")))
            }),
        )
        .expect("register mailer");
    assert_eq!(registry.handler_state("mailer"), Some(HandlerState::WaitingDependency));

    registry
        .add_sub_resolver(Arc::new(FixedSetting))
        .expect("add sub-resolver");
    assert_eq!(registry.handler_state("mailer"), Some(HandlerState::Valid));

    let mailer = registry.resolve("mailer", None).expect("resolve mailer");
    assert_eq!(as_string(&mailer), "mailer with setting for mailer");
}

#[test]
fn name_hint_and_selection_policy_pick_the_provider() {
    let registry = Registry::new();
    registry
        .register_record(transient("memory").services(["store"]), named("memory"))
        .expect("register memory");
    registry
        .register_record(transient("disk").services(["store"]), named("disk"))
        .expect("register disk");

    let newest = registry.resolve("store", None).expect("default policy");
    assert_eq!(as_string(&newest), "disk");
    let hinted = registry.resolve("store", Some("memory")).expect("hinted");
    assert_eq!(as_string(&hinted), "memory");
    assert!(matches!(
        registry.resolve("store", Some("tape")),
        Err(KernelError::NoHandler(service)) if service == "store"
    ));

    let config = KernelConfig::from_json_str(r#"{"selection":"first_registered"}"#)
        .expect("config parses");
    let oldest_first = Registry::with_config(config);
    oldest_first
        .register_record(transient("memory").services(["store"]), named("memory"))
        .expect("register memory");
    oldest_first
        .register_record(transient("disk").services(["store"]), named("disk"))
        .expect("register disk");
    let oldest = oldest_first.resolve("store", None).expect("first registered");
    assert_eq!(as_string(&oldest), "memory");
    assert_eq!(oldest_first.config().selection, SelectionPolicy::FirstRegistered);
}

#[test]
fn unknown_service_is_no_handler() {
    let registry = Registry::new();
    let err = registry.resolve("ghost", None).expect_err("nothing registered");
    assert!(matches!(err, KernelError::NoHandler(service) if service == "ghost"));
}

#[test]
fn hinted_dependency_uses_that_key() {
    let registry = Registry::new();
    registry
        .register_record(transient("primary").services(["db"]), named("primary"))
        .expect("register primary");
    registry
        .register_record(transient("replica").services(["db"]), named("replica"))
        .expect("register replica");
    registry
        .register_record(
            transient("reporting").depends_on(DependencySpec::required("db").named("primary")),
            FnActivator::new(|deps| {
                let db = deps.required::<String>("db")?;
                Ok(instance(format!("reporting on {db}")))
            }),
        )
        .expect("register reporting");

    let reporting = registry.resolve("reporting", None).expect("resolve reporting");
    assert_eq!(as_string(&reporting), "reporting on primary");

    registry.unregister("primary").expect("unregister primary");
    assert_eq!(
        registry.handler_state("reporting"),
        Some(HandlerState::WaitingDependency)
    );
}

#[test]
fn collection_and_optional_dependencies() {
    let registry = Registry::new();
    registry
        .register_record(
            transient("dashboard")
                .depends_on(DependencySpec::collection("widget"))
                .depends_on(DependencySpec::optional("theme")),
            FnActivator::new(|deps| {
                let widgets: Vec<String> = deps
                    .collection::<String>("widget")
                    .iter()
                    .map(|widget| widget.as_str().to_string())
                    .collect();
                let theme = deps
                    .single::<String>("theme")
                    .map(|theme| theme.as_str().to_string())
                    .unwrap_or_else(|| "default".to_string());
                Ok(instance(format!("{} / {theme}", widgets.join(","))))
            }),
        )
        .expect("register dashboard");

    let empty = registry.resolve("dashboard", None).expect("no widgets yet");
    assert_eq!(as_string(&empty), " / default");

    registry
        .register_record(transient("clock").services(["widget"]), named("clock"))
        .expect("register clock");
    registry
        .register_record(transient("weather").services(["widget"]), named("weather"))
        .expect("register weather");
    registry
        .register_record(
            transient("news")
                .services(["widget"])
                .depends_on(DependencySpec::required("feed")),
            named("news"),
        )
        .expect("register news");
    registry
        .register_record(transient("theme"), named("dark"))
        .expect("register theme");

    let full = registry.resolve("dashboard", None).expect("with widgets");
    assert_eq!(as_string(&full), "clock,weather / dark");

    let widgets: Vec<String> = registry
        .resolve_all("widget")
        .expect("resolve all widgets")
        .iter()
        .map(as_string)
        .collect();
    assert_eq!(widgets, vec!["clock", "weather"]);
}

#[test]
fn releasing_root_cascades_through_its_burden() {
    let registry = Registry::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    for key in ["engine", "wheels"] {
        let destroyed = log.clone();
        let name = key.to_string();
        registry
            .register_record(
                transient(key),
                FnActivator::new(|_| Ok(instance(()))).on_destroy(move |_| {
                    destroyed.lock().push(name.clone());
                }),
            )
            .expect("register part");
    }
    let destroyed = log.clone();
    registry
        .register_record(
            transient("car")
                .depends_on(DependencySpec::required("engine"))
                .depends_on(DependencySpec::required("wheels")),
            FnActivator::new(|_| Ok(instance(()))).on_destroy(move |_| {
                destroyed.lock().push("car".to_string());
            }),
        )
        .expect("register car");

    let car = registry.resolve("car", None).expect("resolve car");
    assert_eq!(registry.tracked_count(), 1);
    assert!(registry.release(&car));
    assert_eq!(*log.lock(), vec!["car", "wheels", "engine"]);
    assert_eq!(registry.tracked_count(), 0);
}

#[test]
fn factory_failure_releases_dependencies_already_created() {
    let registry = Registry::new();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = destroyed.clone();
    registry
        .register_record(
            transient("buffer"),
            FnActivator::new(|_| Ok(instance(Vec::<u8>::new()))).on_destroy(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("register buffer");
    registry
        .register_record(
            transient("socket"),
            FnActivator::new(|_| {
                Err(ActivationError::caused_by(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }),
        )
        .expect("register socket");
    registry
        .register_record(
            transient("client")
                .depends_on(DependencySpec::required("buffer"))
                .depends_on(DependencySpec::required("socket")),
            FnActivator::new(|_| Ok(instance(()))),
        )
        .expect("register client");

    let err = registry.resolve("client", None).expect_err("socket fails");
    match &err {
        KernelError::Factory { key, source } => {
            assert_eq!(key, "socket");
            assert!(source.source().is_some());
        }
        other => panic!("expected factory error, got {other}"),
    }
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(registry.tracked_count(), 0);
}

#[test]
fn proxy_wraps_vended_instance_and_destroy_sees_raw() {
    struct Audited(Instance);

    let registry = Registry::new();
    let destroyed_raw = Arc::new(Mutex::new(Vec::new()));
    let seen = destroyed_raw.clone();
    let descriptor = ComponentDescriptor::new(
        transient("ledger"),
        FnActivator::new(|_| Ok(instance(String::from("ledger")))).on_destroy(move |raw| {
            if let Some(text) = raw.downcast_ref::<String>() {
                seen.lock().push(text.clone());
            }
        }),
    )
    .expect("valid descriptor")
    .with_proxy(Arc::new(
        |raw: Instance, _: &ComponentDescriptor| -> Result<Instance, ActivationError> {
            Ok(instance(Audited(raw)))
        },
    ));
    registry.register(descriptor).expect("register ledger");

    let vended = registry.resolve("ledger", None).expect("resolve ledger");
    let audited = vended.downcast_ref::<Audited>().expect("proxied instance");
    assert_eq!(audited.0.downcast_ref::<String>().map(String::as_str), Some("ledger"));

    assert!(registry.release(&vended));
    assert_eq!(*destroyed_raw.lock(), vec!["ledger".to_string()]);
}

#[test]
fn events_arrive_in_order_and_listeners_may_reenter() {
    let registry = Arc::new(Registry::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    let weak: Weak<Registry> = Arc::downgrade(&registry);
    let subscription = registry.subscribe(move |event: &KernelEvent| {
        let registered = weak.upgrade().map(|registry| registry.len()).unwrap_or(0);
        log.lock()
            .push(format!("{}:{}:{}", event.kind(), event.key(), registered));
    });

    registry
        .register_record(transient("job"), FnActivator::new(|_| Ok(instance(()))))
        .expect("register job");
    let job = registry.resolve("job", None).expect("resolve job");
    registry.release(&job);
    assert!(registry.unsubscribe(subscription));
    registry.resolve("job", None).expect("unobserved resolve");

    assert_eq!(
        *seen.lock(),
        vec![
            "handler_state_changed:job:1",
            "instance_created:job:1",
            "instance_destroyed:job:1",
        ]
    );
}

#[test]
fn dispose_releases_tracked_then_handlers_newest_first() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();

    let record = |key: &str, lifestyle: Lifestyle| {
        RegistrationRecord::new(key, "Component").lifestyle(lifestyle)
    };
    let recorder = |key: &'static str| {
        let log = log.clone();
        FnActivator::new(|_| Ok(instance(()))).on_destroy(move |_| log.lock().push(key))
    };

    registry
        .register_record(record("config", Lifestyle::Singleton), recorder("config"))
        .expect("register config");
    registry
        .register_record(
            record("database", Lifestyle::Singleton)
                .depends_on(DependencySpec::required("config")),
            recorder("database"),
        )
        .expect("register database");
    registry
        .register_record(record("query", Lifestyle::Transient), recorder("query"))
        .expect("register query");

    registry.resolve("database", None).expect("resolve database");
    registry.resolve("query", None).expect("resolve query");
    registry.dispose();

    assert_eq!(*log.lock(), vec!["query", "database", "config"]);
    assert!(registry.is_empty());
    assert!(matches!(
        registry.unregister("config"),
        Err(KernelError::Disposed)
    ));
}

#[test]
fn typed_resolution_reports_mismatch_and_releases() {
    let registry = Registry::new();
    registry
        .register_record(transient("greeting"), named("hello"))
        .expect("register greeting");

    let text = registry
        .resolve_as::<String>("greeting")
        .expect("string resolves");
    assert_eq!(text.as_str(), "hello");

    let err = registry
        .resolve_as::<u64>("greeting")
        .expect_err("not a u64");
    assert!(matches!(err, KernelError::TypeMismatch { ref service, .. } if service == "greeting"));
    assert_eq!(registry.tracked_count(), 1);
}

#[test]
fn registration_records_are_validated_and_keys_synthesized() {
    let registry = Registry::new();
    let err = registry
        .register_record(
            RegistrationRecord::new("bad key", "Component"),
            FnActivator::new(|_| Ok(instance(()))),
        )
        .expect_err("space in key");
    assert!(matches!(
        err,
        KernelError::InvalidRegistration(RecordValidationError::InvalidKey(_))
    ));

    let record: RegistrationRecord = serde_json::from_value(serde_json::json!({
        "services": ["metrics"],
        "implementation": "PrometheusMetrics",
        "lifestyle": { "kind": "transient" }
    }))
    .expect("record deserializes");
    let handler = registry
        .register_record(record, FnActivator::new(|_| Ok(instance(()))))
        .expect("register synthetic");
    assert!(handler.key().starts_with("PrometheusMetrics#"));
    assert_eq!(registry.handlers_for("metrics").len(), 1);
}
