#![cfg_attr(not(test), no_std)]

// Data layouts and decision helpers shared between userspace and the
// cgroup eBPF programs. Keep this crate `no_std` friendly so it can be used
// from eBPF code.

pub const MIN_SYSTEM_UID: u32 = 0;
pub const MAX_SYSTEM_UID: u32 = 9999;
/// Kernel overflow uid, never assigned to an app.
pub const NONEXISTENT_UID: u32 = 65534;
pub const LOOPBACK_IFINDEX: u32 = 1;
pub const IFNAMSIZ: usize = 16;
pub const COUNTERSETS_LIMIT: u32 = 2;

pub const BPF_DROP: i32 = 0;
pub const BPF_PASS: i32 = 1;

// Rule bits stored in `UidOwnerValue::rule` and in the enabled-rules
// configuration entry.
pub const DOZABLE_MATCH: u8 = 1 << 0;
pub const STANDBY_MATCH: u8 = 1 << 1;
pub const POWERSAVE_MATCH: u8 = 1 << 2;
pub const IIF_MATCH: u8 = 1 << 3;

pub const UID_RULES_CONFIGURATION_KEY: u32 = 1;
pub const CURRENT_STATS_MAP_CONFIGURATION_KEY: u32 = 2;
pub const SELECT_MAP_A: u8 = 0;
pub const SELECT_MAP_B: u8 = 1;

/// Hash maps are created without preallocation.
pub const BPF_F_NO_PREALLOC: u32 = 1;

pub const COOKIE_TAG_MAP: &str = "traffic_cookie_tag_map";
pub const UID_COUNTERSET_MAP: &str = "traffic_uid_counterset_map";
pub const APP_UID_STATS_MAP: &str = "traffic_app_uid_stats_map";
pub const STATS_MAP_A: &str = "traffic_stats_map_A";
pub const STATS_MAP_B: &str = "traffic_stats_map_B";
pub const IFACE_STATS_MAP: &str = "traffic_iface_stats_map";
pub const CONFIGURATION_MAP: &str = "traffic_configuration_map";
pub const UID_OWNER_MAP: &str = "traffic_uid_owner_map";
pub const IFACE_INDEX_NAME_MAP: &str = "traffic_iface_index_name_map";

pub const COOKIE_UID_MAP_SIZE: u32 = 10000;
pub const UID_COUNTERSET_MAP_SIZE: u32 = 10000;
pub const UID_STATS_MAP_SIZE: u32 = 10000;
pub const STATS_MAP_SIZE: u32 = 10000;
pub const IFACE_INDEX_NAME_MAP_SIZE: u32 = 1000;
pub const IFACE_STATS_MAP_SIZE: u32 = 1000;
pub const CONFIGURATION_MAP_SIZE: u32 = 2;
pub const UID_OWNER_MAP_SIZE: u32 = 10000;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_ESP: u8 = 50;
const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const IPV4_PROTO_OFF: usize = 9;
const IPV6_PROTO_OFF: usize = 6;
const IPV6_HEADER_LEN: usize = 40;
const TCP_FLAG_OFF: usize = 13;
const RST_OFFSET: u8 = 2;

/// Owner of a tagged socket, keyed by socket cookie.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct UidTag {
    pub uid: u32,
    pub tag: u32,
}

/// One accounting bucket in a stats generation table.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StatsKey {
    pub uid: u32,
    pub tag: u32,
    pub counter_set: u32,
    pub iface_index: u32,
}

impl StatsKey {
    /// The zero-tag bucket every tagged bucket is double counted into.
    pub const fn untagged(self) -> Self {
        Self { tag: 0, ..self }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct StatsValue {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

impl StatsValue {
    /// Non-atomic charge used by userspace aggregation.
    pub fn charge(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Egress => {
                self.tx_packets = self.tx_packets.wrapping_add(1);
                self.tx_bytes = self.tx_bytes.wrapping_add(bytes);
            }
            Direction::Ingress => {
                self.rx_packets = self.rx_packets.wrapping_add(1);
                self.rx_bytes = self.rx_bytes.wrapping_add(bytes);
            }
        }
    }

    pub fn accumulate(&mut self, other: &StatsValue) {
        self.rx_packets = self.rx_packets.wrapping_add(other.rx_packets);
        self.rx_bytes = self.rx_bytes.wrapping_add(other.rx_bytes);
        self.tx_packets = self.tx_packets.wrapping_add(other.tx_packets);
        self.tx_bytes = self.tx_bytes.wrapping_add(other.tx_bytes);
    }
}

/// Per-UID policy entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct UidOwnerValue {
    /// Allowed ingress interface when `IIF_MATCH` is set, 0 for none.
    pub iif: u32,
    pub rule: u8,
    pub pad: [u8; 3],
}

impl UidOwnerValue {
    pub const fn new(rule: u8, iif: u32) -> Self {
        Self {
            iif,
            rule,
            pad: [0; 3],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct IfaceValue {
    pub name: [u8; IFNAMSIZ],
}

impl IfaceValue {
    /// Returns `None` when the name does not fit with its NUL terminator.
    pub fn from_name(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= IFNAMSIZ {
            return None;
        }
        let mut value = Self::default();
        value.name[..bytes.len()].copy_from_slice(bytes);
        Some(value)
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(IFNAMSIZ);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Egress = 0,
    Ingress = 1,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Drop,
    Pass,
}

impl Verdict {
    pub const fn as_ret(self) -> i32 {
        match self {
            Verdict::Drop => BPF_DROP,
            Verdict::Pass => BPF_PASS,
        }
    }
}

/// Which of the two stats generation tables a configuration value selects.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Generation {
    A,
    B,
}

impl Generation {
    pub const fn from_config(value: u8) -> Option<Self> {
        match value {
            SELECT_MAP_A => Some(Generation::A),
            SELECT_MAP_B => Some(Generation::B),
            _ => None,
        }
    }

    pub const fn config_value(self) -> u8 {
        match self {
            Generation::A => SELECT_MAP_A,
            Generation::B => SELECT_MAP_B,
        }
    }

    pub const fn other(self) -> Self {
        match self {
            Generation::A => Generation::B,
            Generation::B => Generation::A,
        }
    }

    pub const fn map_name(self) -> &'static str {
        match self {
            Generation::A => STATS_MAP_A,
            Generation::B => STATS_MAP_B,
        }
    }
}

pub const fn is_system_uid(uid: u32) -> bool {
    uid >= MIN_SYSTEM_UID && uid <= MAX_SYSTEM_UID
}

/// Exemption predicate: IPsec ESP packets and TCP segments carrying RST are
/// never dropped by owner rules. `skb_protocol` is the host-order ethertype
/// and `load` reads one byte at an offset from the network header.
pub fn skip_owner_match<F>(skb_protocol: u16, mut load: F) -> bool
where
    F: FnMut(usize) -> Option<u8>,
{
    let (proto, tcp_offset) = match skb_protocol {
        ETH_P_IP => {
            let Some(proto) = load(IPV4_PROTO_OFF) else {
                return false;
            };
            let ihl = match load(0) {
                Some(b) => (b & 0x0F) as usize,
                None => 0,
            };
            (proto, ihl * 4)
        }
        ETH_P_IPV6 => {
            let Some(proto) = load(IPV6_PROTO_OFF) else {
                return false;
            };
            (proto, IPV6_HEADER_LEN)
        }
        _ => return false,
    };

    match proto {
        IPPROTO_ESP => true,
        IPPROTO_TCP => match load(tcp_offset + TCP_FLAG_OFF) {
            Some(flags) => (flags >> RST_OFFSET) & 1 == 1,
            None => false,
        },
        _ => false,
    }
}

/// Owner-rule evaluation for a non-exempt packet.
///
/// `enabled_rules` is the global enabled-rules bitmask (0 when absent) and
/// `entry` the uid's policy entry, if any.
pub fn owner_match(
    uid: u32,
    direction: Direction,
    ifindex: u32,
    enabled_rules: u8,
    entry: Option<UidOwnerValue>,
) -> Verdict {
    if is_system_uid(uid) {
        return Verdict::Pass;
    }

    let uid_rules = entry.map(|e| e.rule).unwrap_or(0);
    let allowed_iif = entry.map(|e| e.iif).unwrap_or(0);

    if enabled_rules & DOZABLE_MATCH != 0 && uid_rules & DOZABLE_MATCH == 0 {
        return Verdict::Drop;
    }
    if enabled_rules & STANDBY_MATCH != 0 && uid_rules & STANDBY_MATCH != 0 {
        return Verdict::Drop;
    }
    if enabled_rules & POWERSAVE_MATCH != 0 && uid_rules & POWERSAVE_MATCH == 0 {
        return Verdict::Drop;
    }
    if direction == Direction::Ingress
        && uid_rules & IIF_MATCH != 0
        && allowed_iif != 0
        && ifindex != LOOPBACK_IFINDEX
        && ifindex != allowed_iif
    {
        return Verdict::Drop;
    }
    Verdict::Pass
}

/// Egress traffic that is about to be dropped is never charged.
pub const fn should_account(direction: Direction, verdict: Verdict) -> bool {
    !matches!((direction, verdict), (Direction::Egress, Verdict::Drop))
}

/// Buckets charged for one packet: the optional tagged bucket, the
/// untagged bucket and the per-UID aggregate key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AccountingPlan {
    pub tagged: Option<StatsKey>,
    pub untagged: StatsKey,
    pub uid: u32,
}

/// `owner` is the cookie's `UidTag` when the socket was tagged.
pub fn accounting_plan(
    sock_uid: u32,
    owner: Option<UidTag>,
    counter_set: Option<u8>,
    ifindex: u32,
) -> AccountingPlan {
    let (uid, tag) = match owner {
        Some(t) => (t.uid, t.tag),
        None => (sock_uid, 0),
    };
    let key = StatsKey {
        uid,
        tag,
        counter_set: counter_set.map(u32::from).unwrap_or(0),
        iface_index: ifindex,
    };
    AccountingPlan {
        tagged: if tag != 0 { Some(key) } else { None },
        untagged: key.untagged(),
        uid,
    }
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for these types so they can be
// used with aya's typed map APIs. We keep this behind a feature so the
// no_std eBPF side doesn't pull in userspace-only dependencies.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{IfaceValue, StatsKey, StatsValue, UidOwnerValue, UidTag};
    use aya::Pod;

    unsafe impl Pod for UidTag {}
    unsafe impl Pod for StatsKey {}
    unsafe impl Pod for StatsValue {}
    unsafe impl Pod for UidOwnerValue {}
    unsafe impl Pod for IfaceValue {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    fn bytes_of<T>(value: &T) -> &[u8] {
        unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
    }

    #[test]
    fn layouts_match_kernel_contract() {
        assert_eq!(size_of::<UidTag>(), 8);
        assert_eq!(size_of::<StatsKey>(), 16);
        assert_eq!(size_of::<StatsValue>(), 32);
        assert_eq!(size_of::<UidOwnerValue>(), 8);
        assert_eq!(size_of::<IfaceValue>(), IFNAMSIZ);

        assert_eq!(offset_of!(StatsKey, uid), 0);
        assert_eq!(offset_of!(StatsKey, tag), 4);
        assert_eq!(offset_of!(StatsKey, counter_set), 8);
        assert_eq!(offset_of!(StatsKey, iface_index), 12);
        assert_eq!(offset_of!(StatsValue, rx_packets), 0);
        assert_eq!(offset_of!(StatsValue, rx_bytes), 8);
        assert_eq!(offset_of!(StatsValue, tx_packets), 16);
        assert_eq!(offset_of!(StatsValue, tx_bytes), 24);
        assert_eq!(offset_of!(UidOwnerValue, iif), 0);
        assert_eq!(offset_of!(UidOwnerValue, rule), 4);
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn stats_key_byte_image_is_stable() {
        let key = StatsKey {
            uid: 10007,
            tag: 0xAABB_CCDD,
            counter_set: 1,
            iface_index: 3,
        };
        let expected: [u8; 16] = [
            0x17, 0x27, 0, 0, 0xDD, 0xCC, 0xBB, 0xAA, 1, 0, 0, 0, 3, 0, 0, 0,
        ];
        assert_eq!(bytes_of(&key), &expected);

        let owner = UidOwnerValue::new(DOZABLE_MATCH | IIF_MATCH, 7);
        assert_eq!(bytes_of(&owner), &[7, 0, 0, 0, 9, 0, 0, 0]);
    }

    #[test]
    fn iface_value_round_trips_names() {
        let v = IfaceValue::from_name("rmnet_data0").unwrap();
        assert_eq!(v.name(), "rmnet_data0");
        assert!(IfaceValue::from_name("").is_none());
        assert!(IfaceValue::from_name("sixteen_chars_xx").is_none());
    }

    #[test]
    fn system_uids_always_pass() {
        let all = DOZABLE_MATCH | STANDBY_MATCH | POWERSAVE_MATCH;
        let hostile = Some(UidOwnerValue::new(STANDBY_MATCH | IIF_MATCH, 42));
        for uid in [MIN_SYSTEM_UID, 1000, MAX_SYSTEM_UID] {
            for dir in [Direction::Ingress, Direction::Egress] {
                assert_eq!(owner_match(uid, dir, 9, all, hostile), Verdict::Pass);
            }
        }
        assert_eq!(
            owner_match(MAX_SYSTEM_UID + 1, Direction::Egress, 9, all, hostile),
            Verdict::Drop
        );
    }

    #[test]
    fn dozable_and_powersave_require_allow_bit() {
        let app = 10001;
        assert_eq!(
            owner_match(app, Direction::Egress, 2, DOZABLE_MATCH, None),
            Verdict::Drop
        );
        assert_eq!(
            owner_match(
                app,
                Direction::Egress,
                2,
                DOZABLE_MATCH,
                Some(UidOwnerValue::new(DOZABLE_MATCH, 0))
            ),
            Verdict::Pass
        );
        assert_eq!(
            owner_match(
                app,
                Direction::Ingress,
                2,
                POWERSAVE_MATCH,
                Some(UidOwnerValue::new(DOZABLE_MATCH, 0))
            ),
            Verdict::Drop
        );
    }

    #[test]
    fn standby_drops_only_flagged_uids() {
        let app = 10002;
        assert_eq!(
            owner_match(app, Direction::Egress, 2, STANDBY_MATCH, None),
            Verdict::Pass
        );
        assert_eq!(
            owner_match(
                app,
                Direction::Egress,
                2,
                STANDBY_MATCH,
                Some(UidOwnerValue::new(STANDBY_MATCH, 0))
            ),
            Verdict::Drop
        );
        // Bits on the uid do nothing while the category is globally off.
        assert_eq!(
            owner_match(
                app,
                Direction::Egress,
                2,
                0,
                Some(UidOwnerValue::new(STANDBY_MATCH, 0))
            ),
            Verdict::Pass
        );
    }

    #[test]
    fn interface_restriction_applies_to_ingress_only() {
        let app = 10003;
        let entry = Some(UidOwnerValue::new(IIF_MATCH, 5));
        assert_eq!(
            owner_match(app, Direction::Ingress, 6, 0, entry),
            Verdict::Drop
        );
        assert_eq!(
            owner_match(app, Direction::Ingress, 5, 0, entry),
            Verdict::Pass
        );
        assert_eq!(
            owner_match(app, Direction::Ingress, LOOPBACK_IFINDEX, 0, entry),
            Verdict::Pass
        );
        assert_eq!(owner_match(app, Direction::Egress, 6, 0, entry), Verdict::Pass);
        // No allowed interface recorded means no restriction.
        assert_eq!(
            owner_match(
                app,
                Direction::Ingress,
                6,
                0,
                Some(UidOwnerValue::new(IIF_MATCH, 0))
            ),
            Verdict::Pass
        );
    }

    fn reader(packet: &[u8]) -> impl FnMut(usize) -> Option<u8> + '_ {
        move |off| packet.get(off).copied()
    }

    #[test]
    fn esp_and_tcp_rst_are_exempt() {
        let mut v4 = [0u8; 40];
        v4[0] = 0x45;
        v4[9] = IPPROTO_ESP;
        assert!(skip_owner_match(ETH_P_IP, reader(&v4)));

        v4[9] = IPPROTO_TCP;
        v4[20 + TCP_FLAG_OFF] = 0x04;
        assert!(skip_owner_match(ETH_P_IP, reader(&v4)));

        v4[20 + TCP_FLAG_OFF] = 0x10;
        assert!(!skip_owner_match(ETH_P_IP, reader(&v4)));

        let mut v6 = [0u8; 60];
        v6[IPV6_PROTO_OFF] = IPPROTO_TCP;
        v6[IPV6_HEADER_LEN + TCP_FLAG_OFF] = 0x14;
        assert!(skip_owner_match(ETH_P_IPV6, reader(&v6)));

        v6[IPV6_PROTO_OFF] = 17;
        assert!(!skip_owner_match(ETH_P_IPV6, reader(&v6)));
    }

    #[test]
    fn ipv4_options_shift_the_tcp_header() {
        let mut v4 = [0u8; 60];
        v4[0] = 0x46;
        v4[9] = IPPROTO_TCP;
        v4[24 + TCP_FLAG_OFF] = 0x04;
        assert!(skip_owner_match(ETH_P_IP, reader(&v4)));
    }

    #[test]
    fn truncated_packets_are_not_exempt() {
        let v4 = [0x45u8, 0, 0, 0, 0, 0, 0, 0, 0, IPPROTO_TCP];
        assert!(!skip_owner_match(ETH_P_IP, reader(&v4)));
        assert!(!skip_owner_match(0x0806, reader(&v4)));
    }

    #[test]
    fn egress_drops_are_not_charged() {
        assert!(!should_account(Direction::Egress, Verdict::Drop));
        assert!(should_account(Direction::Ingress, Verdict::Drop));
        assert!(should_account(Direction::Egress, Verdict::Pass));
    }

    #[test]
    fn tagged_traffic_is_double_counted() {
        let plan = accounting_plan(
            10010,
            Some(UidTag {
                uid: 10020,
                tag: 0x77,
            }),
            Some(1),
            4,
        );
        let tagged = plan.tagged.unwrap();
        assert_eq!(tagged.uid, 10020);
        assert_eq!(tagged.tag, 0x77);
        assert_eq!(plan.untagged, StatsKey { tag: 0, ..tagged });
        assert_eq!(plan.uid, 10020);

        let plain = accounting_plan(10010, None, None, 4);
        assert!(plain.tagged.is_none());
        assert_eq!(
            plain.untagged,
            StatsKey {
                uid: 10010,
                tag: 0,
                counter_set: 0,
                iface_index: 4
            }
        );
    }

    #[test]
    fn generation_config_values() {
        assert_eq!(Generation::from_config(SELECT_MAP_A), Some(Generation::A));
        assert_eq!(Generation::from_config(SELECT_MAP_B), Some(Generation::B));
        assert_eq!(Generation::from_config(7), None);
        assert_eq!(Generation::A.other(), Generation::B);
        assert_eq!(Generation::B.map_name(), STATS_MAP_B);
    }

    #[test]
    fn charge_follows_direction() {
        let mut v = StatsValue::default();
        v.charge(Direction::Ingress, 1500);
        v.charge(Direction::Egress, 60);
        v.charge(Direction::Egress, 40);
        assert_eq!(
            v,
            StatsValue {
                rx_packets: 1,
                rx_bytes: 1500,
                tx_packets: 2,
                tx_bytes: 100
            }
        );
    }
}
