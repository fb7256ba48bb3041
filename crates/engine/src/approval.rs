//! ApprovalCache (C7, SPEC_FULL.md §4.7): in-memory, per-session set of
//! approval fingerprints. No persistence — a new session starts empty.

use std::collections::HashSet;

use sa_domain::tool::ToolDefinition;

/// `(tool_name, approval_key)`. The approval-key component is computed by
/// `ToolDefinition::approval_key`'s policy (§4.7/§3's `ApprovalKeyPolicy`).
pub type Fingerprint = (String, String);

pub fn fingerprint(def: &ToolDefinition, args: &serde_json::Value) -> Fingerprint {
    (def.name.clone(), def.approval_key.approval_key(args))
}

#[derive(Debug, Default)]
pub struct ApprovalCache {
    approved: HashSet<Fingerprint>,
}

impl ApprovalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.approved.contains(fp)
    }

    pub fn add(&mut self, fp: Fingerprint) {
        self.approved.insert(fp);
    }

    /// Clear every remembered approval (user command or new session, §4.7).
    pub fn revoke_all(&mut self) {
        self.approved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::tool::{ApprovalKeyPolicy, ToolKind};

    fn def(name: &str, policy: ApprovalKeyPolicy) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            kind: ToolKind::Internal,
            description: String::new(),
            json_schema: serde_json::json!({}),
            auto_approved: false,
            approval_key: policy,
            hide_results: false,
            available_in_plan_mode: None,
            command_argv: None,
            serialize: false,
            mcp_server_id: None,
        }
    }

    #[test]
    fn fresh_cache_contains_nothing() {
        let cache = ApprovalCache::new();
        let def = def("read_file", ApprovalKeyPolicy::Default);
        let fp = fingerprint(&def, &serde_json::json!({"path": "a"}));
        assert!(!cache.contains(&fp));
    }

    #[test]
    fn add_then_contains() {
        let mut cache = ApprovalCache::new();
        let def = def("read_file", ApprovalKeyPolicy::Default);
        let fp = fingerprint(&def, &serde_json::json!({"path": "a"}));
        cache.add(fp.clone());
        assert!(cache.contains(&fp));
    }

    #[test]
    fn different_args_yield_different_fingerprints_by_default() {
        let def = def("read_file", ApprovalKeyPolicy::Default);
        let fp1 = fingerprint(&def, &serde_json::json!({"path": "a"}));
        let fp2 = fingerprint(&def, &serde_json::json!({"path": "b"}));
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn approval_memoization_one_prompt_for_same_fingerprint() {
        // Given a tool with autoApproved=false, calling it twice with args
        // yielding the same fingerprint after an allow-session answer
        // triggers exactly one approval prompt (§8).
        let mut cache = ApprovalCache::new();
        let def = def("read_file", ApprovalKeyPolicy::Default);
        let args = serde_json::json!({"path": "a"});
        let fp = fingerprint(&def, &args);

        assert!(!cache.contains(&fp)); // prompt #1 would fire
        cache.add(fp.clone()); // user answered allow-session

        assert!(cache.contains(&fp)); // second call: no prompt
        assert!(cache.contains(&fingerprint(&def, &args)));
    }

    #[test]
    fn revoke_all_clears_cache() {
        let mut cache = ApprovalCache::new();
        let def = def("read_file", ApprovalKeyPolicy::Default);
        let fp = fingerprint(&def, &serde_json::json!({"path": "a"}));
        cache.add(fp.clone());
        cache.revoke_all();
        assert!(!cache.contains(&fp));
    }

    #[test]
    fn excludes_arguments_policy_collapses_to_single_fingerprint() {
        let def = def("bash", ApprovalKeyPolicy::ExcludesArguments);
        let fp1 = fingerprint(&def, &serde_json::json!({"cmd": "ls"}));
        let fp2 = fingerprint(&def, &serde_json::json!({"cmd": "pwd"}));
        assert_eq!(fp1, fp2);
    }
}
