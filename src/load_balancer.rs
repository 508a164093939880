// Copyright 2020 Joyent, Inc.

//! Host selection policies.
//!
//! A load balancer is bound to one worker-local host set (and optionally to
//! the local cluster's host set for zone-aware routing) and picks one host
//! per request. Selection never takes locks shared with the primary: the
//! host set it reads is the worker's own replica.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rand::Rng;

use crate::cluster::ClusterInfo;
use crate::error::Error;
use crate::host::{Host, HostSet};
use crate::runtime::Runtime;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadBalancerType {
    RoundRobin,
    LeastRequest,
    Random,
}

impl LoadBalancerType {
    pub fn from_config(value: &str) -> Result<Self, Error> {
        match value {
            "round_robin" => Ok(LoadBalancerType::RoundRobin),
            "least_request" => Ok(LoadBalancerType::LeastRequest),
            "random" => Ok(LoadBalancerType::Random),
            other => Err(Error::UnknownLbType(other.to_string())),
        }
    }
}

pub struct LoadBalancer {
    lb_type: LoadBalancerType,
    host_set: Rc<RefCell<HostSet>>,
    local_host_set: Option<Rc<RefCell<HostSet>>>,
    info: Arc<ClusterInfo>,
    runtime: Arc<dyn Runtime>,
    rr_index: usize,
}

impl LoadBalancer {
    pub fn new(
        lb_type: LoadBalancerType,
        host_set: Rc<RefCell<HostSet>>,
        local_host_set: Option<Rc<RefCell<HostSet>>>,
        info: Arc<ClusterInfo>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        LoadBalancer {
            lb_type,
            host_set,
            local_host_set,
            info,
            runtime,
            rr_index: 0,
        }
    }

    /// Picks a host for one request, or `None` when the cluster has no
    /// usable members at all.
    pub fn choose_host<R: Rng>(&mut self, rng: &mut R) -> Option<Arc<Host>> {
        let host_set = self.host_set.clone();
        let hs = host_set.borrow();
        let local_set = self.local_host_set.clone();
        let local_guard = local_set.as_ref().map(|l| l.borrow());
        let candidates = self.hosts_to_use(&hs, local_guard.as_deref(), rng);
        if candidates.is_empty() {
            return None;
        }
        let index = match self.lb_type {
            LoadBalancerType::RoundRobin => {
                let index = self.rr_index % candidates.len();
                self.rr_index = self.rr_index.wrapping_add(1);
                index
            }
            LoadBalancerType::Random => rng.gen_range(0..candidates.len()),
            LoadBalancerType::LeastRequest => {
                if candidates.len() == 1 {
                    0
                } else {
                    // Power of two choices: sample two members and take the
                    // one with fewer in-flight requests.
                    let first = rng.gen_range(0..candidates.len());
                    let second = rng.gen_range(0..candidates.len());
                    let first_active = candidates[first].stats().rq_active.value();
                    let second_active = candidates[second].stats().rq_active.value();
                    if second_active < first_active {
                        second
                    } else {
                        first
                    }
                }
            }
        };
        Some(candidates[index].clone())
    }

    // Resolves the candidate vector for this request: full set in panic
    // mode, a same-zone slice when zone routing applies, the healthy set
    // otherwise.
    fn hosts_to_use<'a, R: Rng>(
        &self,
        hs: &'a HostSet,
        local: Option<&'a HostSet>,
        rng: &mut R,
    ) -> &'a [Arc<Host>] {
        if hs.hosts().is_empty() {
            return hs.hosts();
        }

        let healthy_pct = (100 * hs.healthy_hosts().len() / hs.hosts().len()) as u64;
        let panic_threshold = self
            .runtime
            .get_integer("upstream.healthy_panic_threshold", 50);
        if healthy_pct < panic_threshold {
            self.info.stats().lb_healthy_panic.inc();
            return hs.hosts();
        }
        if hs.healthy_hosts().is_empty() {
            return hs.hosts();
        }

        // Zone awareness only applies to the stateless-cycling policies.
        let zone_capable = matches!(
            self.lb_type,
            LoadBalancerType::RoundRobin | LoadBalancerType::Random
        );
        if zone_capable {
            if let Some(local) = local {
                if self
                    .runtime
                    .feature_enabled("upstream.zone_routing.enabled", 100)
                {
                    if let Some(zone_hosts) = self.zone_candidates(hs, local, rng) {
                        return zone_hosts;
                    }
                }
            }
        }

        hs.healthy_hosts()
    }

    fn zone_candidates<'a, R: Rng>(
        &self,
        hs: &'a HostSet,
        local: &HostSet,
        rng: &mut R,
    ) -> Option<&'a [Arc<Host>]> {
        // Index zero is the local zone in every partitioning.
        let upstream_zone = hs.healthy_hosts_per_zone().first()?;
        let upstream_zone_full = hs.hosts_per_zone().first()?;
        let local_zone = local.healthy_hosts_per_zone().first()?;
        if upstream_zone.is_empty() || upstream_zone_full.is_empty() || local_zone.is_empty() {
            return None;
        }

        // Zone health floor: when too few of the local zone's upstream
        // members are healthy, spreading across zones beats piling onto
        // the survivors.
        let zone_healthy_pct = (100 * upstream_zone.len() / upstream_zone_full.len()) as u64;
        let zone_floor = self
            .runtime
            .get_integer("upstream.zone_routing.healthy_panic_threshold", 80);
        if zone_healthy_pct < zone_floor {
            return None;
        }

        let local_total = local.healthy_hosts().len();
        let upstream_total = hs.healthy_hosts().len();
        if local_total == 0 || upstream_total == 0 {
            return None;
        }
        let local_share = local_zone.len() as f64 / local_total as f64;
        let upstream_share = upstream_zone.len() as f64 / upstream_total as f64;

        // The local zone serves its own traffic when it holds at least its
        // proportional share of healthy capacity; below that, route
        // same-zone only for the fraction of requests it can absorb.
        if upstream_share >= local_share {
            return Some(upstream_zone);
        }
        if rng.gen::<f64>() < upstream_share / local_share {
            Some(upstream_zone)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{health_flags, partition_by_zone, HostVec};
    use crate::runtime::StaticRuntime;
    use crate::stats::StatsStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn test_info() -> Arc<ClusterInfo> {
        ClusterInfo::new(
            "test".to_string(),
            LoadBalancerType::RoundRobin,
            0,
            None,
            &StatsStore::new(),
        )
    }

    fn make_host(info: &Arc<ClusterInfo>, addr: &str, zone: &str) -> Arc<Host> {
        Host::new(
            info.clone(),
            format!("tcp://{}", addr),
            addr.parse().unwrap(),
            zone.to_string(),
            HashMap::new(),
            None,
        )
    }

    fn host_set_of(hosts: Vec<Arc<Host>>, local_zone: &str) -> Rc<RefCell<HostSet>> {
        let mut hs = HostSet::new();
        let healthy: HostVec = hosts.iter().filter(|h| h.healthy()).cloned().collect();
        let hosts_pz = partition_by_zone(&hosts, local_zone);
        let healthy_pz = partition_by_zone(&healthy, local_zone);
        hs.update_hosts(
            Arc::new(hosts),
            Arc::new(healthy),
            Arc::new(hosts_pz),
            Arc::new(healthy_pz),
            vec![],
            vec![],
        );
        Rc::new(RefCell::new(hs))
    }

    fn lb(
        lb_type: LoadBalancerType,
        hosts: Rc<RefCell<HostSet>>,
        local: Option<Rc<RefCell<HostSet>>>,
        runtime: Arc<StaticRuntime>,
    ) -> LoadBalancer {
        LoadBalancer::new(lb_type, hosts, local, test_info(), runtime)
    }

    #[test]
    fn round_robin_cycles_healthy_hosts() {
        let info = test_info();
        let h1 = make_host(&info, "10.0.0.1:80", "");
        let h2 = make_host(&info, "10.0.0.2:80", "");
        let hs = host_set_of(vec![h1.clone(), h2.clone()], "");
        let mut lb = lb(
            LoadBalancerType::RoundRobin,
            hs,
            None,
            Arc::new(StaticRuntime::new()),
        );
        let mut rng = StdRng::seed_from_u64(1);
        let picks: Vec<String> = (0..4)
            .map(|_| lb.choose_host(&mut rng).unwrap().url().to_string())
            .collect();
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn empty_set_returns_none() {
        let hs = host_set_of(vec![], "");
        let mut lb = lb(
            LoadBalancerType::RoundRobin,
            hs,
            None,
            Arc::new(StaticRuntime::new()),
        );
        let mut rng = StdRng::seed_from_u64(1);
        assert!(lb.choose_host(&mut rng).is_none());
    }

    #[test]
    fn panic_mode_uses_full_host_vector() {
        let info = test_info();
        let h1 = make_host(&info, "10.0.0.1:80", "");
        let h2 = make_host(&info, "10.0.0.2:80", "");
        let h3 = make_host(&info, "10.0.0.3:80", "");
        h2.set_health_flag(health_flags::FAILED_ACTIVE_HC);
        h3.set_health_flag(health_flags::FAILED_ACTIVE_HC);
        // 1/3 healthy is below the 50% default panic floor.
        let hs = host_set_of(vec![h1, h2.clone(), h3], "");
        let mut lb = lb(
            LoadBalancerType::RoundRobin,
            hs,
            None,
            Arc::new(StaticRuntime::new()),
        );
        let mut rng = StdRng::seed_from_u64(1);
        let urls: Vec<String> = (0..3)
            .map(|_| lb.choose_host(&mut rng).unwrap().url().to_string())
            .collect();
        assert!(urls.contains(&h2.url().to_string()));
    }

    #[test]
    fn healthy_hosts_preferred_above_panic_floor() {
        let info = test_info();
        let h1 = make_host(&info, "10.0.0.1:80", "");
        let h2 = make_host(&info, "10.0.0.2:80", "");
        h2.set_health_flag(health_flags::FAILED_ACTIVE_HC);
        // 1/2 healthy sits exactly on the floor, which does not panic.
        let hs = host_set_of(vec![h1.clone(), h2], "");
        let mut lb = lb(
            LoadBalancerType::RoundRobin,
            hs,
            None,
            Arc::new(StaticRuntime::new()),
        );
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            assert_eq!(lb.choose_host(&mut rng).unwrap().url(), h1.url());
        }
    }

    #[test]
    fn least_request_prefers_idle_host() {
        let info = test_info();
        let busy = make_host(&info, "10.0.0.1:80", "");
        let idle = make_host(&info, "10.0.0.2:80", "");
        busy.stats().rq_active.set(10);
        let hs = host_set_of(vec![busy, idle.clone()], "");
        let mut lb = lb(
            LoadBalancerType::LeastRequest,
            hs,
            None,
            Arc::new(StaticRuntime::new()),
        );
        let mut rng = StdRng::seed_from_u64(7);
        let mut idle_picks = 0;
        for _ in 0..100 {
            if Arc::ptr_eq(&lb.choose_host(&mut rng).unwrap(), &idle) {
                idle_picks += 1;
            }
        }
        // Two random samples agree on the idle host 3 times out of 4.
        assert!(idle_picks > 60, "idle host picked {} times", idle_picks);
    }

    #[test]
    fn random_picks_only_healthy_hosts() {
        let info = test_info();
        let h1 = make_host(&info, "10.0.0.1:80", "");
        let h2 = make_host(&info, "10.0.0.2:80", "");
        let hs = host_set_of(vec![h1, h2], "");
        let mut lb = lb(
            LoadBalancerType::Random,
            hs,
            None,
            Arc::new(StaticRuntime::new()),
        );
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            assert!(lb.choose_host(&mut rng).unwrap().healthy());
        }
    }

    #[test]
    fn zone_routing_restricts_to_local_zone() {
        let info = test_info();
        let same_zone = make_host(&info, "10.0.0.1:80", "zone-a");
        let other_zone = make_host(&info, "10.0.0.2:80", "zone-b");
        let hs = host_set_of(vec![same_zone.clone(), other_zone], "zone-a");

        let local_host = make_host(&info, "10.1.0.1:80", "zone-a");
        let local_other = make_host(&info, "10.1.0.2:80", "zone-b");
        let local = host_set_of(vec![local_host, local_other], "zone-a");

        let mut lb = lb(
            LoadBalancerType::RoundRobin,
            hs,
            Some(local),
            Arc::new(StaticRuntime::new()),
        );
        let mut rng = StdRng::seed_from_u64(5);
        // Upstream zone-a holds 1/2 of healthy capacity and the local zone
        // originates 1/2 of traffic, so routing stays in-zone.
        for _ in 0..20 {
            assert!(Arc::ptr_eq(&lb.choose_host(&mut rng).unwrap(), &same_zone));
        }
    }

    #[test]
    fn zone_routing_dropped_below_zone_health_floor() {
        let info = test_info();
        let zone_a_sick = make_host(&info, "10.0.0.1:80", "zone-a");
        let zone_a_ok = make_host(&info, "10.0.0.2:80", "zone-a");
        let zone_b1 = make_host(&info, "10.0.0.3:80", "zone-b");
        let zone_b2 = make_host(&info, "10.0.0.4:80", "zone-b");
        zone_a_sick.set_health_flag(health_flags::FAILED_ACTIVE_HC);
        // zone-a is 50% healthy, under the 80% zone floor; overall health
        // is 75%, over the global panic floor.
        let hs = host_set_of(vec![zone_a_sick, zone_a_ok, zone_b1.clone(), zone_b2], "zone-a");

        let local_host = make_host(&info, "10.1.0.1:80", "zone-a");
        let local = host_set_of(vec![local_host], "zone-a");

        let mut lb = lb(
            LoadBalancerType::Random,
            hs,
            Some(local),
            Arc::new(StaticRuntime::new()),
        );
        let mut rng = StdRng::seed_from_u64(11);
        let mut saw_zone_b = false;
        for _ in 0..50 {
            if lb.choose_host(&mut rng).unwrap().zone() == "zone-b" {
                saw_zone_b = true;
            }
        }
        assert!(saw_zone_b);
    }
}
