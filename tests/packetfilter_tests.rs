//! Tests for the ingress whitelister.
//!
//! Scripts the `tc` helper, the ifindex→name resolution, and the
//! kernel-map opener to validate the qdisc policy, the classifier
//! loading sequence, and the bit-exact allow-map encodings.

use async_trait::async_trait;
use emberbox::bpfmap::MapOpener;
use emberbox::{
    Error, KernelMap, LinkNamer, PacketWhitelister, Result, TcPacketWhitelister, TcRunner,
    INGRESS_FILTER_OBJECT,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const IP_MAP_PIN: &str = "/sys/fs/bpf/tc/globals/ifce_allowed_ip";
const MAC_MAP_PIN: &str = "/sys/fs/bpf/tc/globals/ifce_allowed_macs";

// =============================================================================
// Doubles
// =============================================================================

/// `tc` double: scripted `qdisc show` answers, everything recorded, and
/// the object file staged for `filter add` captured byte-for-byte.
#[derive(Default)]
struct ScriptedTc {
    show_answers: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
    staged_object: Mutex<Option<Vec<u8>>>,
}

impl ScriptedTc {
    fn with_shows(answers: &[&str]) -> Self {
        Self {
            show_answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TcRunner for ScriptedTc {
    async fn tc(&self, args: &[&str]) -> Result<String> {
        self.calls.lock().unwrap().push(args.join(" "));

        if args.starts_with(&["qdisc", "show"]) {
            return Ok(self
                .show_answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default());
        }

        if args.starts_with(&["filter", "add"]) {
            let obj = args
                .iter()
                .position(|a| *a == "obj")
                .map(|i| args[i + 1])
                .expect("filter add without obj path");
            *self.staged_object.lock().unwrap() = Some(std::fs::read(obj).unwrap());
        }

        Ok(String::new())
    }
}

struct FixedLinkNamer;

#[async_trait]
impl LinkNamer for FixedLinkNamer {
    async fn name_of(&self, ifindex: u32) -> Result<String> {
        assert_eq!(ifindex, 3, "tests resolve ifindex 3 only");
        Ok("fake1".to_string())
    }
}

/// In-memory allow map.
#[derive(Default)]
struct FakeMap {
    entries: Mutex<Vec<(u32, u64)>>,
}

impl FakeMap {
    fn entries_vec(&self) -> Vec<(u32, u64)> {
        self.entries.lock().unwrap().clone()
    }
}

struct SharedMap(Arc<FakeMap>);

impl KernelMap for SharedMap {
    fn get(&self, key: u32) -> Result<u64> {
        self.0
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .ok_or(Error::MapEntryNotFound(key))
    }

    fn set(&self, key: u32, value: u64) -> Result<()> {
        let mut entries = self.0.entries.lock().unwrap();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            entries.push((key, value));
        }
        Ok(())
    }

    fn delete(&self, key: u32) -> Result<()> {
        self.0.entries.lock().unwrap().retain(|(k, _)| *k != key);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(u32, u64)>> {
        Ok(self.0.entries_vec())
    }
}

struct Harness {
    tc: Arc<ScriptedTc>,
    ip_map: Arc<FakeMap>,
    mac_map: Arc<FakeMap>,
    whitelister: TcPacketWhitelister,
}

fn harness(tc: ScriptedTc) -> Harness {
    let tc = Arc::new(tc);
    let ip_map = Arc::new(FakeMap::default());
    let mac_map = Arc::new(FakeMap::default());

    let opener: Arc<MapOpener> = {
        let ip_map = Arc::clone(&ip_map);
        let mac_map = Arc::clone(&mac_map);
        Arc::new(move |pin: &str| -> Result<Box<dyn KernelMap>> {
            match pin {
                IP_MAP_PIN => Ok(Box::new(SharedMap(Arc::clone(&ip_map)))),
                MAC_MAP_PIN => Ok(Box::new(SharedMap(Arc::clone(&mac_map)))),
                other => panic!("unexpected map pin {other}"),
            }
        })
    };

    let whitelister = TcPacketWhitelister::with_helpers(
        Arc::clone(&tc) as Arc<dyn TcRunner>,
        Arc::new(FixedLinkNamer),
        opener,
    );

    Harness {
        tc,
        ip_map,
        mac_map,
        whitelister,
    }
}

// =============================================================================
// Install
// =============================================================================

#[tokio::test]
async fn install_on_noqueue_attaches_and_whitelists() {
    let h = harness(ScriptedTc::with_shows(&[
        "qdisc noqueue 0: dev fake1 root refcnt 2\n",
    ]));

    h.whitelister
        .install(3, "172.19.0.2", "aa:bb:cc:dd:ee:ff")
        .await
        .unwrap();

    let calls = h.tc.calls();
    assert_eq!(calls[0], "qdisc show dev fake1");
    assert_eq!(calls[1], "qdisc add dev fake1 clsact");
    assert_eq!(calls[2], "filter del dev fake1 ingress");
    assert!(calls[3].starts_with("filter add dev fake1 ingress bpf da obj "));
    assert!(calls[3].ends_with(" sec ingress"));
    assert_eq!(calls.len(), 4);

    // The staged object must be the embedded classifier, byte for byte.
    assert_eq!(
        h.tc.staged_object.lock().unwrap().as_deref(),
        Some(INGRESS_FILTER_OBJECT)
    );

    assert_eq!(h.ip_map.entries_vec(), vec![(3, 0x0200_13AC)]);
    assert_eq!(h.mac_map.entries_vec(), vec![(3, 0x0000_AABB_CCDD_EEFF)]);
}

#[tokio::test]
async fn install_does_not_reapply_existing_clsact() {
    let h = harness(ScriptedTc::with_shows(&[
        "qdisc clsact ffff: dev fake1 parent ffff:fff1\n",
    ]));

    h.whitelister
        .install(3, "172.19.0.2", "aa:bb:cc:dd:ee:ff")
        .await
        .unwrap();

    let calls = h.tc.calls();
    assert!(
        !calls.iter().any(|c| c.contains("qdisc add")),
        "clsact already present must not be re-added: {calls:?}"
    );
    assert!(calls.iter().any(|c| c.starts_with("filter add")));
}

#[tokio::test]
async fn install_replaces_fq_codel_then_attaches() {
    let h = harness(ScriptedTc::with_shows(&[
        "qdisc fq_codel 0: dev fake1 root refcnt 2 limit 10240p flows 1024\n",
        "qdisc noqueue 0: dev fake1 root refcnt 2\n",
    ]));

    h.whitelister
        .install(3, "172.19.0.2", "aa:bb:cc:dd:ee:ff")
        .await
        .unwrap();

    let calls = h.tc.calls();
    assert_eq!(calls[0], "qdisc show dev fake1");
    assert_eq!(calls[1], "qdisc replace dev fake1 root noqueue");
    assert_eq!(calls[2], "qdisc show dev fake1");
    assert_eq!(calls[3], "qdisc add dev fake1 clsact");
}

#[tokio::test]
async fn install_refuses_novel_qdisc() {
    let h = harness(ScriptedTc::with_shows(&[
        "qdisc htb 1: dev fake1 root refcnt 2 r2q 10\n",
    ]));

    let err = h
        .whitelister
        .install(3, "172.19.0.2", "aa:bb:cc:dd:ee:ff")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnexpectedQdisc { .. }));
    assert!(
        !h.tc.calls().iter().any(|c| c.starts_with("filter")),
        "no filter work after refusing the qdisc"
    );
    assert!(h.ip_map.entries_vec().is_empty());
}

#[tokio::test]
async fn install_refuses_when_replacement_does_not_settle() {
    // Replacement happened but the re-read still reports fq_codel.
    let h = harness(ScriptedTc::with_shows(&[
        "qdisc fq_codel 0: dev fake1 root refcnt 2\n",
        "qdisc fq_codel 0: dev fake1 root refcnt 2\n",
    ]));

    let err = h
        .whitelister
        .install(3, "172.19.0.2", "aa:bb:cc:dd:ee:ff")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnexpectedQdisc { .. }));
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn update_writes_both_maps_without_touching_tc() {
    let h = harness(ScriptedTc::default());

    h.whitelister
        .update(3, "3.32.232.192", "84:f6:fa:00:33:ab")
        .await
        .unwrap();

    assert!(h.tc.calls().is_empty());
    assert_eq!(h.ip_map.entries_vec(), vec![(3, 0xC0E8_2003)]);
    assert_eq!(h.mac_map.entries_vec(), vec![(3, 0x0000_84F6_FA00_33AB)]);
}

#[tokio::test]
async fn update_refuses_ipv6_without_map_writes() {
    let h = harness(ScriptedTc::default());

    let err = h
        .whitelister
        .update(3, "fe80::19f1:67:adca:3eb3", "aa:bb:cc:dd:ee:ff")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidIp(_)));
    assert!(h.ip_map.entries_vec().is_empty());
    assert!(h.mac_map.entries_vec().is_empty());
}

#[tokio::test]
async fn update_refuses_hostnames() {
    let h = harness(ScriptedTc::default());
    let err = h
        .whitelister
        .update(3, "google.com", "84:f6:fa:00:33:ab")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidIp(_)));
}

#[tokio::test]
async fn update_refuses_overlong_mac_without_map_writes() {
    let h = harness(ScriptedTc::default());

    let err = h
        .whitelister
        .update(3, "192.168.0.3", "84:f6:fa:00:33:ab:dd:ee:ff:aa")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidMac(_)));
    assert!(h.ip_map.entries_vec().is_empty());
    assert!(h.mac_map.entries_vec().is_empty());
}

#[tokio::test]
async fn update_overwrites_previous_assignment() {
    let h = harness(ScriptedTc::default());

    h.whitelister
        .update(3, "172.19.0.2", "aa:bb:cc:dd:ee:ff")
        .await
        .unwrap();
    h.whitelister
        .update(3, "172.19.0.9", "aa:bb:cc:dd:ee:01")
        .await
        .unwrap();

    assert_eq!(h.ip_map.entries_vec(), vec![(3, 0x0900_13AC)]);
    assert_eq!(h.mac_map.entries_vec(), vec![(3, 0x0000_AABB_CCDD_EE01)]);
}
