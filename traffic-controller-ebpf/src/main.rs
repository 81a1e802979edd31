#![no_std]
#![no_main]

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::EbpfContext;
use aya_ebpf::bindings::{BPF_NOEXIST, __sk_buff};
use aya_ebpf::helpers::{bpf_get_socket_cookie, bpf_get_socket_uid};
use aya_ebpf::macros::{cgroup_skb, map};
use aya_ebpf::maps::HashMap;
use aya_ebpf::programs::SkBuffContext;
use traffic_controller_common::{
    BPF_F_NO_PREALLOC, COOKIE_UID_MAP_SIZE, CONFIGURATION_MAP_SIZE,
    CURRENT_STATS_MAP_CONFIGURATION_KEY, Direction, Generation, IFACE_INDEX_NAME_MAP_SIZE,
    IFACE_STATS_MAP_SIZE, IfaceValue, STATS_MAP_SIZE, StatsKey, StatsValue, UID_COUNTERSET_MAP_SIZE,
    UID_OWNER_MAP_SIZE, UID_RULES_CONFIGURATION_KEY, UID_STATS_MAP_SIZE, UidOwnerValue, UidTag,
    Verdict, accounting_plan, owner_match, should_account, skip_owner_match,
};

// Every map is pinned by name so the control plane can create or reuse it
// before this object is loaded.

#[map(name = "traffic_cookie_tag_map")]
static COOKIE_TAG_MAP: HashMap<u64, UidTag> =
    HashMap::<u64, UidTag>::pinned(COOKIE_UID_MAP_SIZE, BPF_F_NO_PREALLOC);

#[map(name = "traffic_uid_counterset_map")]
static UID_COUNTERSET_MAP: HashMap<u32, u8> =
    HashMap::<u32, u8>::pinned(UID_COUNTERSET_MAP_SIZE, BPF_F_NO_PREALLOC);

#[map(name = "traffic_app_uid_stats_map")]
static APP_UID_STATS_MAP: HashMap<u32, StatsValue> =
    HashMap::<u32, StatsValue>::pinned(UID_STATS_MAP_SIZE, BPF_F_NO_PREALLOC);

#[map(name = "traffic_stats_map_A")]
static STATS_MAP_A: HashMap<StatsKey, StatsValue> =
    HashMap::<StatsKey, StatsValue>::pinned(STATS_MAP_SIZE, BPF_F_NO_PREALLOC);

#[map(name = "traffic_stats_map_B")]
static STATS_MAP_B: HashMap<StatsKey, StatsValue> =
    HashMap::<StatsKey, StatsValue>::pinned(STATS_MAP_SIZE, BPF_F_NO_PREALLOC);

#[map(name = "traffic_iface_stats_map")]
static IFACE_STATS_MAP: HashMap<u32, StatsValue> =
    HashMap::<u32, StatsValue>::pinned(IFACE_STATS_MAP_SIZE, BPF_F_NO_PREALLOC);

#[map(name = "traffic_configuration_map")]
static CONFIGURATION_MAP: HashMap<u32, u8> =
    HashMap::<u32, u8>::pinned(CONFIGURATION_MAP_SIZE, BPF_F_NO_PREALLOC);

#[map(name = "traffic_uid_owner_map")]
static UID_OWNER_MAP: HashMap<u32, UidOwnerValue> =
    HashMap::<u32, UidOwnerValue>::pinned(UID_OWNER_MAP_SIZE, BPF_F_NO_PREALLOC);

// Written only by userspace; declared here so the loader reuses the pin.
#[map(name = "traffic_iface_index_name_map")]
static IFACE_INDEX_NAME_MAP: HashMap<u32, IfaceValue> =
    HashMap::<u32, IfaceValue>::pinned(IFACE_INDEX_NAME_MAP_SIZE, BPF_F_NO_PREALLOC);

#[cgroup_skb(ingress)]
pub fn cgroup_ingress(ctx: SkBuffContext) -> i32 {
    traffic_account(&ctx, Direction::Ingress).as_ret()
}

#[cgroup_skb(egress)]
pub fn cgroup_egress(ctx: SkBuffContext) -> i32 {
    traffic_account(&ctx, Direction::Egress).as_ret()
}

fn traffic_account(ctx: &SkBuffContext, direction: Direction) -> Verdict {
    let skb = ctx.as_ptr() as *mut __sk_buff;
    let sock_uid = unsafe { bpf_get_socket_uid(skb) };
    let ifindex = unsafe { (*skb).ifindex };
    let protocol = u16::from_be(unsafe { (*skb).protocol } as u16);

    let verdict = if skip_owner_match(protocol, |off| ctx.load::<u8>(off).ok()) {
        Verdict::Pass
    } else {
        let enabled_rules = config_value(UID_RULES_CONFIGURATION_KEY).unwrap_or(0);
        let entry = unsafe { UID_OWNER_MAP.get(&sock_uid) }.copied();
        owner_match(sock_uid, direction, ifindex, enabled_rules, entry)
    };

    if !should_account(direction, verdict) {
        return verdict;
    }

    let cookie = unsafe { bpf_get_socket_cookie(ctx.as_ptr()) };
    let owner = unsafe { COOKIE_TAG_MAP.get(&cookie) }.copied();
    let uid = owner.map(|t| t.uid).unwrap_or(sock_uid);
    let counter_set = unsafe { UID_COUNTERSET_MAP.get(&uid) }.copied();
    let plan = accounting_plan(sock_uid, owner, counter_set, ifindex);

    // The generation is read once per packet; a concurrent swap may still
    // see this packet land in the old table.
    let Some(generation) =
        config_value(CURRENT_STATS_MAP_CONFIGURATION_KEY).and_then(Generation::from_config)
    else {
        return verdict;
    };
    let stats_map = match generation {
        Generation::A => &STATS_MAP_A,
        Generation::B => &STATS_MAP_B,
    };

    let len = ctx.len() as u64;
    if let Some(tagged) = plan.tagged {
        update_stats(stats_map, &tagged, direction, len);
    }
    update_stats(stats_map, &plan.untagged, direction, len);
    update_stats(&APP_UID_STATS_MAP, &plan.uid, direction, len);
    update_stats(&IFACE_STATS_MAP, &ifindex, direction, len);

    verdict
}

fn config_value(key: u32) -> Option<u8> {
    unsafe { CONFIGURATION_MAP.get(&key) }.copied()
}

#[inline(always)]
fn update_stats<K>(map: &HashMap<K, StatsValue>, key: &K, direction: Direction, len: u64) {
    let value = match map.get_ptr_mut(key) {
        Some(ptr) => ptr,
        None => {
            // Losing the NOEXIST race to another CPU is fine; the lookup
            // below finds the winner's entry.
            let _ = map.insert(key, &StatsValue::default(), BPF_NOEXIST as u64);
            match map.get_ptr_mut(key) {
                Some(ptr) => ptr,
                None => return,
            }
        }
    };

    unsafe {
        match direction {
            Direction::Egress => {
                fetch_add(addr_of_mut!((*value).tx_packets), 1);
                fetch_add(addr_of_mut!((*value).tx_bytes), len);
            }
            Direction::Ingress => {
                fetch_add(addr_of_mut!((*value).rx_packets), 1);
                fetch_add(addr_of_mut!((*value).rx_bytes), len);
            }
        }
    }
}

#[inline(always)]
unsafe fn fetch_add(field: *mut u64, delta: u64) {
    unsafe { AtomicU64::from_ptr(field) }.fetch_add(delta, Ordering::Relaxed);
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
