//! Command registry (§4.4): the stable `cmd_id → (name, mode)` table that
//! `lscmd` reports and dispatch consults to decide replication/read-only
//! enforcement. New ids can be registered at runtime; this module only
//! carries metadata, [`crate::server::dispatch`] owns execution.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    /// Neither reads nor writes persistent state.
    Pure,
    /// Touches hierarchy state but must not alter it.
    ReadOnly,
    /// On success, its raw request bytes are replicated (§4.9).
    Mutate,
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub id: i8,
    pub name: &'static str,
    pub mode: CommandMode,
}

#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    by_id: Vec<Option<CommandSpec>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut reg = CommandRegistry { by_id: Vec::new() };
        for (id, name, mode) in DEFAULT_COMMANDS {
            reg.register(CommandSpec { id: *id, name, mode: *mode });
        }
        reg
    }

    pub fn register(&mut self, spec: CommandSpec) {
        let idx = spec.id as usize;
        if self.by_id.len() <= idx {
            self.by_id.resize(idx + 1, None);
        }
        self.by_id[idx] = Some(spec);
    }

    pub fn get(&self, id: i8) -> Option<&CommandSpec> {
        if id < 0 {
            return None;
        }
        self.by_id.get(id as usize).and_then(|s| s.as_ref())
    }

    /// `lscmd`: every registered `(id, name)` pair, in id order.
    pub fn list(&self) -> impl Iterator<Item = (i8, &str)> {
        self.by_id.iter().filter_map(|s| s.as_ref()).map(|s| (s.id, s.name))
    }
}

use CommandMode::*;

/// The reference id space (§6), plus a handful of supplement ids for
/// hierarchy operations the representative table names but doesn't
/// enumerate (edge add/del, alias, restore, inherit, node-type lookup,
/// purge, and a `lscmd`-adjacent `info`).
const DEFAULT_COMMANDS: &[(i8, &str, CommandMode)] = &[
    (0, "ping", Pure),
    (1, "echo", Pure),
    (2, "lscmd", Pure),
    (3, "info", Pure),
    (14, "load", Mutate),
    (15, "save", Pure),
    (16, "purge", Mutate),
    (17, "hierarchy.find", ReadOnly),
    (19, "hierarchy.aggregate", ReadOnly),
    (20, "hierarchy.edgeAdd", Mutate),
    (21, "hierarchy.edgeDel", Mutate),
    (22, "hierarchy.setAlias", Mutate),
    (23, "hierarchy.del", Mutate),
    (24, "hierarchy.heads", ReadOnly),
    (25, "hierarchy.parents", ReadOnly),
    (26, "hierarchy.children", ReadOnly),
    (27, "hierarchy.edgeList", ReadOnly),
    (28, "hierarchy.edgeGet", ReadOnly),
    (29, "hierarchy.edgeGetMetadata", ReadOnly),
    (30, "hierarchy.compress", Mutate),
    (31, "hierarchy.restore", Mutate),
    (32, "hierarchy.inherit", ReadOnly),
    (33, "nodeType.add", Mutate),
    (34, "nodeType.clear", Mutate),
    (35, "nodeType.list", Pure),
    (36, "nodeType.get", Pure),
    (41, "rpn.evalBool", Pure),
    (42, "rpn.evalDouble", Pure),
    (43, "rpn.evalInteger", Pure),
    (44, "rpn.evalSet", Pure),
    (45, "object.get", ReadOnly),
    (46, "object.set", Mutate),
    (47, "object.del", Mutate),
    (48, "object.exists", ReadOnly),
    (49, "object.incr", Mutate),
    (50, "object.arrayPush", Mutate),
    (51, "object.arrayInsert", Mutate),
    (52, "object.arrayRemove", Mutate),
    (53, "subscription.add", Mutate),
    (54, "subscription.addMarker", Mutate),
    (55, "subscription.del", Mutate),
    (56, "subscription.refresh", Mutate),
    (57, "subscription.list", Pure),
    (58, "subscription.debug", Pure),
    (63, "modify", Mutate),
    (64, "update", Mutate),
    // None of these touch the hierarchy itself: `replicasync` only reads it
    // to build a snapshot, and `replicainit`/`replicaof` are control plane.
    // Marking any of them `Mutate` would feed their own request bytes back
    // into the ring buffer for `entries_after` to replay (§4.9), which for
    // `replicaof` in particular would re-spawn the driver on every catch-up.
    (65, "replicainit", Pure),
    (66, "replicasync", Pure),
    (67, "replicaof", Pure),
    (68, "replicainfo", Pure),
];

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn known_command_resolves_with_documented_mode() {
        let reg = CommandRegistry::new();
        let spec = reg.get(0).unwrap();
        assert_eq!(spec.name, "ping");
        assert_eq!(spec.mode, CommandMode::Pure);
    }

    #[test]
    fn unregistered_id_is_absent() {
        let reg = CommandRegistry::new();
        assert!(reg.get(99).is_none());
        assert!(reg.get(-1).is_none());
    }

    #[test]
    fn runtime_registration_adds_a_new_command() {
        let mut reg = CommandRegistry::new();
        reg.register(CommandSpec { id: 100, name: "custom", mode: CommandMode::Pure });
        assert_eq!(reg.get(100).unwrap().name, "custom");
    }

    #[test]
    fn lscmd_lists_every_registered_pair() {
        let reg = CommandRegistry::new();
        let names: Vec<&str> = reg.list().map(|(_, n)| n).collect();
        assert!(names.contains(&"ping"));
        assert!(names.contains(&"hierarchy.find"));
        assert!(names.contains(&"replicainfo"));
    }
}
