//! Broadcaster fan-out against fake hubs

use async_trait::async_trait;
use hzn_control::{
    Broadcaster, ControlError, HubDialer, HubServicesClient, RpcError, SharedCatalog,
    StaticCatalog,
};
use hzn_proto::{
    label_set, Account, AccountServices, HubId, LabelLink, LabelLinks, Noop, ServiceId,
    ServiceRoute,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorded {
    services: Vec<(String, AccountServices)>,
    links: Vec<(String, LabelLinks)>,
    dials: Vec<String>,
}

/// Hands out clients that record what they receive
#[derive(Default)]
struct FakeDialer {
    recorded: Arc<Mutex<Recorded>>,
    unreachable: HashSet<String>,
    rejecting: HashSet<String>,
}

struct FakeHub {
    target: String,
    reject: bool,
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl HubServicesClient for FakeHub {
    async fn add_services(&self, update: &AccountServices) -> hzn_control::Result<Noop> {
        if self.reject {
            return Err(ControlError::Config(format!("{} rejected update", self.target)));
        }
        self.recorded
            .lock()
            .unwrap()
            .services
            .push((self.target.clone(), update.clone()));
        Ok(Noop)
    }

    async fn add_label_links(&self, links: &LabelLinks) -> hzn_control::Result<Noop> {
        if self.reject {
            return Err(ControlError::Config(format!("{} rejected update", self.target)));
        }
        self.recorded
            .lock()
            .unwrap()
            .links
            .push((self.target.clone(), links.clone()));
        Ok(Noop)
    }
}

#[async_trait]
impl HubDialer for FakeDialer {
    async fn dial_hub(&self, target: &str) -> hzn_control::Result<Box<dyn HubServicesClient>> {
        self.recorded.lock().unwrap().dials.push(target.to_string());

        if self.unreachable.contains(target) {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
            .into());
        }

        Ok(Box::new(FakeHub {
            target: target.to_string(),
            reject: self.rejecting.contains(target),
            recorded: self.recorded.clone(),
        }))
    }
}

fn update() -> AccountServices {
    AccountServices {
        account: Account::new("/test", "acct-1"),
        services: vec![ServiceRoute {
            hub: HubId::new(),
            id: ServiceId::new(),
            service_type: "http".to_string(),
            labels: label_set(&[("env", "prod")]),
        }],
    }
}

fn targets() -> Vec<&'static str> {
    vec!["hub-1:443", "hub-2:443", "hub-3:443"]
}

#[tokio::test]
async fn test_all_targets_receive_update() {
    let dialer = Arc::new(FakeDialer::default());
    let broadcaster = Broadcaster::new(Arc::new(StaticCatalog::new(targets())), dialer.clone());

    let update = update();
    broadcaster.advertise_services(&update).await.unwrap();

    let recorded = dialer.recorded.lock().unwrap();
    let received: Vec<&str> = recorded.services.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(received, targets());
    assert!(recorded.services.iter().all(|(_, u)| *u == update));
}

#[tokio::test]
async fn test_failing_target_does_not_stop_the_others() {
    let dialer = Arc::new(FakeDialer {
        rejecting: HashSet::from(["hub-2:443".to_string()]),
        ..Default::default()
    });
    let broadcaster = Broadcaster::new(Arc::new(StaticCatalog::new(targets())), dialer.clone());

    let errs = broadcaster.advertise_services(&update()).await.unwrap_err();

    assert_eq!(errs.len(), 1);
    assert_eq!(errs.errors()[0].target, "hub-2:443");

    let recorded = dialer.recorded.lock().unwrap();
    let received: Vec<&str> = recorded.services.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(received, vec!["hub-1:443", "hub-3:443"]);
}

#[tokio::test]
async fn test_dial_and_call_failures_are_aggregated() {
    let dialer = Arc::new(FakeDialer {
        unreachable: HashSet::from(["hub-1:443".to_string()]),
        rejecting: HashSet::from(["hub-3:443".to_string()]),
        ..Default::default()
    });
    let broadcaster = Broadcaster::new(Arc::new(StaticCatalog::new(targets())), dialer.clone());

    let links = LabelLinks {
        label_links: vec![LabelLink::new(
            Account::new("/test", "acct-1"),
            label_set(&[("app", "web")]),
            label_set(&[("app", "web"), ("env", "prod")]),
        )],
    };
    let errs = broadcaster.advertise_label_links(&links).await.unwrap_err();

    let failed: Vec<&str> = errs.errors().iter().map(|e| e.target.as_str()).collect();
    assert_eq!(failed, vec!["hub-1:443", "hub-3:443"]);
    assert!(matches!(errs.errors()[0].source, ControlError::Rpc(_)));

    let message = errs.to_string();
    assert!(message.starts_with("2 errors occurred:"));
    assert!(message.contains("hub-1:443"));

    let recorded = dialer.recorded.lock().unwrap();
    assert_eq!(recorded.dials.len(), 3);
    assert_eq!(recorded.links.len(), 1);
    assert_eq!(recorded.links[0].0, "hub-2:443");
}

#[tokio::test]
async fn test_catalog_is_read_on_every_broadcast() {
    let catalog = Arc::new(SharedCatalog::new());
    let dialer = Arc::new(FakeDialer::default());
    let broadcaster = Broadcaster::new(catalog.clone(), dialer.clone());

    // No hubs yet: nothing to do, nothing failed.
    broadcaster.advertise_services(&update()).await.unwrap();

    catalog.add_target("hub-1:443");
    broadcaster.advertise_services(&update()).await.unwrap();

    catalog.add_target("hub-2:443");
    broadcaster.advertise_services(&update()).await.unwrap();

    let recorded = dialer.recorded.lock().unwrap();
    let mut per_target: HashMap<&str, usize> = HashMap::new();
    for (target, _) in &recorded.services {
        *per_target.entry(target.as_str()).or_default() += 1;
    }
    assert_eq!(per_target.get("hub-1:443"), Some(&2));
    assert_eq!(per_target.get("hub-2:443"), Some(&1));
}
