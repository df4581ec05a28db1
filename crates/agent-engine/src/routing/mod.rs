//! Squad routing
//!
//! Given an inbound call's context, the [`SquadRouter`] resolves the target
//! squad (explicit id or the tenant default) and applies the squad's routing
//! policy over members currently below their concurrent-call capacity:
//!
//! - round-robin: cycle members in fixed order, skipping agents at capacity
//! - least-busy: fewest active sessions, ties broken by member order
//! - attribute-match: score by matching context attributes (language, caller
//!   tags), ties broken by least-busy then member order
//!
//! The router is pure with respect to session state: it reads per-agent load
//! counters but never touches a `CallSession`. Load is acquired by the
//! orchestrator when a call starts and released at its terminal state.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::types::{
    AgentConfig, AgentId, CallContext, RoutingDecision, RoutingPolicy, Squad, SquadId, TenantId,
};

/// Routes inbound calls across pools of configured agents
#[derive(Debug, Default)]
pub struct SquadRouter {
    agents: DashMap<AgentId, Arc<AgentConfig>>,
    squads: DashMap<SquadId, Arc<Squad>>,
    default_squads: DashMap<TenantId, SquadId>,
    /// Active-session count per agent; the only state the router mutates
    load: DashMap<AgentId, Arc<AtomicUsize>>,
    /// Round-robin cursor per squad
    cursors: DashMap<SquadId, Arc<AtomicUsize>>,
}

impl SquadRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an agent configuration
    pub fn upsert_agent(&self, config: AgentConfig) {
        self.load
            .entry(config.id.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        debug!("registered agent {} ({})", config.id, config.display_name);
        self.agents.insert(config.id.clone(), Arc::new(config));
    }

    /// Register or replace a squad; replaced wholesale, never mutated mid-route
    pub fn upsert_squad(&self, squad: Squad) {
        self.cursors
            .entry(squad.id.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        debug!(
            "registered squad {} with {} members",
            squad.id,
            squad.members.len()
        );
        self.squads.insert(squad.id.clone(), Arc::new(squad));
    }

    /// Set the default squad used when a call context has no explicit squad
    pub fn set_default_squad(&self, tenant_id: TenantId, squad_id: SquadId) -> Result<()> {
        if !self.squads.contains_key(&squad_id) {
            return Err(EngineError::SquadNotFound {
                squad_id: squad_id.0,
            });
        }
        self.default_squads.insert(tenant_id, squad_id);
        Ok(())
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<Arc<AgentConfig>> {
        self.agents.get(agent_id).map(|a| Arc::clone(&a))
    }

    pub fn squad(&self, squad_id: &SquadId) -> Option<Arc<Squad>> {
        self.squads.get(squad_id).map(|s| Arc::clone(&s))
    }

    /// Active session count of one agent
    pub fn active_calls(&self, agent_id: &AgentId) -> usize {
        self.load
            .get(agent_id)
            .map(|l| l.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Increment an agent's active-call count (called once per started call)
    pub fn acquire(&self, agent_id: &AgentId) {
        if let Some(load) = self.load.get(agent_id) {
            load.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Decrement an agent's active-call count (called once per terminal state)
    pub fn release(&self, agent_id: &AgentId) {
        if let Some(load) = self.load.get(agent_id) {
            let previous = load.fetch_sub(1, Ordering::AcqRel);
            if previous == 0 {
                // Should not happen: acquire/release are paired by the orchestrator
                warn!("load underflow for agent {}", agent_id);
                load.store(0, Ordering::Release);
            }
        }
    }

    /// Route one inbound call to a member of its squad
    ///
    /// Does not mutate any session state; only produces a decision. Returns
    /// `NoAgentAvailable` when every member is at capacity or the squad is
    /// empty; queueing vs. rejection is the host's fallback concern.
    pub fn route(&self, ctx: &CallContext) -> Result<RoutingDecision> {
        let mut reasons = Vec::new();

        let squad = match &ctx.squad_id {
            Some(id) => {
                reasons.push("explicit_squad".to_string());
                self.squad(id).ok_or_else(|| EngineError::SquadNotFound {
                    squad_id: id.0.clone(),
                })?
            }
            None => {
                reasons.push("tenant_default_squad".to_string());
                let id = self
                    .default_squads
                    .get(&ctx.tenant_id)
                    .map(|s| s.clone())
                    .ok_or_else(|| EngineError::SquadNotFound {
                        squad_id: format!("default for tenant {}", ctx.tenant_id),
                    })?;
                self.squad(&id).ok_or_else(|| EngineError::SquadNotFound {
                    squad_id: id.0,
                })?
            }
        };

        // Members currently below capacity, in squad order
        let available: Vec<(usize, Arc<AgentConfig>, usize)> = squad
            .members
            .iter()
            .enumerate()
            .filter_map(|(index, id)| {
                let agent = self.agent(id)?;
                let active = self.active_calls(id);
                (active < agent.max_concurrent_calls).then_some((index, agent, active))
            })
            .collect();

        if available.is_empty() {
            debug!(
                "squad {} has no available member ({} configured)",
                squad.id,
                squad.members.len()
            );
            return Err(EngineError::NoAgentAvailable {
                squad_id: squad.id.0.clone(),
            });
        }

        let chosen = match squad.policy {
            RoutingPolicy::RoundRobin => {
                reasons.push("round_robin".to_string());
                self.pick_round_robin(&squad, &available)
            }
            RoutingPolicy::LeastBusy => {
                reasons.push("least_busy".to_string());
                Self::pick_least_busy(&available)
            }
            RoutingPolicy::AttributeMatch => {
                reasons.push("attribute_match".to_string());
                Self::pick_attribute_match(ctx, &available, &mut reasons)
            }
        }
        .ok_or_else(|| EngineError::NoAgentAvailable {
            squad_id: squad.id.0.clone(),
        })?;

        debug!(
            "routed call (signal {}) to agent {} via squad {}: {:?}",
            ctx.signal_id, chosen.id, squad.id, reasons
        );

        Ok(RoutingDecision {
            agent_id: chosen.id.clone(),
            variant: None,
            reasons,
        })
    }

    fn pick_round_robin(
        &self,
        squad: &Squad,
        available: &[(usize, Arc<AgentConfig>, usize)],
    ) -> Option<Arc<AgentConfig>> {
        let cursor = self
            .cursors
            .entry(squad.id.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        let start = cursor.fetch_add(1, Ordering::AcqRel) % squad.members.len();

        // Walk members in cyclic order from the cursor, landing on the first
        // one below capacity.
        for offset in 0..squad.members.len() {
            let index = (start + offset) % squad.members.len();
            if let Some((_, agent, _)) = available.iter().find(|(i, _, _)| *i == index) {
                return Some(Arc::clone(agent));
            }
        }
        None
    }

    fn pick_least_busy(
        available: &[(usize, Arc<AgentConfig>, usize)],
    ) -> Option<Arc<AgentConfig>> {
        available
            .iter()
            .min_by_key(|(index, _, active)| (*active, *index))
            .map(|(_, agent, _)| Arc::clone(agent))
    }

    fn pick_attribute_match(
        ctx: &CallContext,
        available: &[(usize, Arc<AgentConfig>, usize)],
        reasons: &mut Vec<String>,
    ) -> Option<Arc<AgentConfig>> {
        let score = |agent: &AgentConfig| -> usize {
            let mut score = 0;
            if ctx.language.as_deref() == Some(agent.language.as_str()) {
                score += 1;
            }
            score += ctx
                .caller_tags
                .iter()
                .filter(|tag| agent.tags.contains(tag))
                .count();
            score
        };

        let (_, agent, _) = available.iter().max_by(|(ia, a, la), (ib, b, lb)| {
            // Highest score wins; ties by least-busy, then member order
            score(a).cmp(&score(b)).then(lb.cmp(la)).then(ib.cmp(ia))
        })?;

        if ctx.language.as_deref() == Some(agent.language.as_str()) {
            reasons.push(format!("language:{}", agent.language));
        }
        for tag in &ctx.caller_tags {
            if agent.tags.contains(tag) {
                reasons.push(format!("tag:{}", tag));
            }
        }
        Some(Arc::clone(agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, language: &str, tags: &[&str], capacity: usize) -> AgentConfig {
        AgentConfig {
            id: AgentId::new(id),
            tenant_id: TenantId::new("tenant-1"),
            display_name: id.to_string(),
            language: language.to_string(),
            voice_id: "voice-1".to_string(),
            system_prompt: "You are a helpful assistant".to_string(),
            temperature: 0.7,
            greeting: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            max_concurrent_calls: capacity,
        }
    }

    fn router_with_squad(policy: RoutingPolicy, agents: Vec<AgentConfig>) -> SquadRouter {
        let router = SquadRouter::new();
        let members: Vec<AgentId> = agents.iter().map(|a| a.id.clone()).collect();
        for a in agents {
            router.upsert_agent(a);
        }
        router.upsert_squad(Squad {
            id: SquadId::new("squad-1"),
            tenant_id: TenantId::new("tenant-1"),
            name: "support".to_string(),
            members,
            policy,
        });
        router
            .set_default_squad(TenantId::new("tenant-1"), SquadId::new("squad-1"))
            .unwrap();
        router
    }

    fn ctx() -> CallContext {
        CallContext::new(TenantId::new("tenant-1"), "sig-1")
    }

    #[test]
    fn least_busy_picks_idle_agent() {
        let router = router_with_squad(
            RoutingPolicy::LeastBusy,
            vec![agent("agent-a", "en", &[], 10), agent("agent-b", "en", &[], 10)],
        );
        // Agent B carries 3 active calls, agent A none
        for _ in 0..3 {
            router.acquire(&AgentId::new("agent-b"));
        }

        let decision = router.route(&ctx()).unwrap();
        assert_eq!(decision.agent_id, AgentId::new("agent-a"));
        assert!(decision.reasons.contains(&"least_busy".to_string()));
    }

    #[test]
    fn least_busy_tie_breaks_by_member_order() {
        let router = router_with_squad(
            RoutingPolicy::LeastBusy,
            vec![agent("agent-a", "en", &[], 10), agent("agent-b", "en", &[], 10)],
        );
        let decision = router.route(&ctx()).unwrap();
        assert_eq!(decision.agent_id, AgentId::new("agent-a"));
    }

    #[test]
    fn round_robin_cycles_members() {
        let router = router_with_squad(
            RoutingPolicy::RoundRobin,
            vec![agent("agent-a", "en", &[], 10), agent("agent-b", "en", &[], 10)],
        );
        let first = router.route(&ctx()).unwrap().agent_id;
        let second = router.route(&ctx()).unwrap().agent_id;
        let third = router.route(&ctx()).unwrap().agent_id;
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn round_robin_skips_agents_at_capacity() {
        let router = router_with_squad(
            RoutingPolicy::RoundRobin,
            vec![agent("agent-a", "en", &[], 1), agent("agent-b", "en", &[], 10)],
        );
        router.acquire(&AgentId::new("agent-a"));

        for _ in 0..4 {
            let decision = router.route(&ctx()).unwrap();
            assert_eq!(decision.agent_id, AgentId::new("agent-b"));
        }
    }

    #[test]
    fn all_members_at_capacity_is_no_agent_available() {
        let router = router_with_squad(
            RoutingPolicy::LeastBusy,
            vec![agent("agent-a", "en", &[], 1), agent("agent-b", "en", &[], 1)],
        );
        router.acquire(&AgentId::new("agent-a"));
        router.acquire(&AgentId::new("agent-b"));

        let err = router.route(&ctx()).unwrap_err();
        assert!(matches!(err, EngineError::NoAgentAvailable { .. }));
        // Routing failure mutates nothing
        assert_eq!(router.active_calls(&AgentId::new("agent-a")), 1);
        assert_eq!(router.active_calls(&AgentId::new("agent-b")), 1);
    }

    #[test]
    fn attribute_match_prefers_language_and_tags() {
        let router = router_with_squad(
            RoutingPolicy::AttributeMatch,
            vec![
                agent("agent-en", "en", &["sales"], 10),
                agent("agent-hi", "hi", &["support"], 10),
            ],
        );
        let mut context = ctx();
        context.language = Some("hi".to_string());
        context.caller_tags = vec!["support".to_string()];

        let decision = router.route(&context).unwrap();
        assert_eq!(decision.agent_id, AgentId::new("agent-hi"));
        assert!(decision.reasons.contains(&"attribute_match".to_string()));
        assert!(decision.reasons.contains(&"language:hi".to_string()));
        assert!(decision.reasons.contains(&"tag:support".to_string()));
    }

    #[test]
    fn attribute_match_ties_fall_back_to_least_busy() {
        let router = router_with_squad(
            RoutingPolicy::AttributeMatch,
            vec![agent("agent-a", "en", &[], 10), agent("agent-b", "en", &[], 10)],
        );
        router.acquire(&AgentId::new("agent-a"));

        // Neither agent matches any attribute; least-busy breaks the tie
        let decision = router.route(&ctx()).unwrap();
        assert_eq!(decision.agent_id, AgentId::new("agent-b"));
    }

    #[test]
    fn explicit_squad_overrides_default() {
        let router = router_with_squad(
            RoutingPolicy::LeastBusy,
            vec![agent("agent-a", "en", &[], 10)],
        );
        router.upsert_agent(agent("agent-z", "en", &[], 10));
        router.upsert_squad(Squad {
            id: SquadId::new("squad-2"),
            tenant_id: TenantId::new("tenant-1"),
            name: "overflow".to_string(),
            members: vec![AgentId::new("agent-z")],
            policy: RoutingPolicy::LeastBusy,
        });

        let mut context = ctx();
        context.squad_id = Some(SquadId::new("squad-2"));
        let decision = router.route(&context).unwrap();
        assert_eq!(decision.agent_id, AgentId::new("agent-z"));
        assert!(decision.reasons.contains(&"explicit_squad".to_string()));
    }

    #[test]
    fn release_restores_capacity() {
        let router = router_with_squad(
            RoutingPolicy::LeastBusy,
            vec![agent("agent-a", "en", &[], 1)],
        );
        router.acquire(&AgentId::new("agent-a"));
        assert!(router.route(&ctx()).is_err());
        router.release(&AgentId::new("agent-a"));
        assert!(router.route(&ctx()).is_ok());
    }
}
