//! Crash helper registry and crash event delivery.
//!
//! Helpers are registered against the plugin instance they care about. When
//! that plugin crashes the whole helper list is taken out of the registry
//! under the service lock and notified afterwards, so event delivery never
//! runs with the lock held.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::capability::PluginId;

pub const PLUGIN_CRASHED_EVENT: &str = "PluginCrashed";

/// Window/document pair a crash event is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashEventTarget {
    pub window_id: u64,
    /// Document currently shown in the window, `None` once it has gone away.
    pub document_id: Option<u64>,
}

/// Caller supplied handle told about crashes of the plugin it uses.
pub trait CrashHelper: Send + Sync {
    /// Window that should receive the crash event, if it is still alive.
    fn crash_event_target(&self) -> Option<CrashEventTarget>;
}

/// Payload describing a plugin crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginCrashedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub plugin_id: PluginId,
    pub plugin_name: String,
    pub submitted_crash_report: bool,
    pub bubbles: bool,
    pub cancelable: bool,
    pub gmp_plugin: bool,
    pub trusted: bool,
    pub chrome_only: bool,
}

impl PluginCrashedEvent {
    pub fn new(plugin_id: PluginId, plugin_name: impl Into<String>) -> Self {
        Self {
            event_type: PLUGIN_CRASHED_EVENT.to_owned(),
            plugin_id,
            plugin_name: plugin_name.into(),
            submitted_crash_report: false,
            bubbles: true,
            cancelable: true,
            gmp_plugin: true,
            trusted: true,
            chrome_only: true,
        }
    }
}

/// Delivers crash events to application level listeners.
pub trait CrashEventSink: Send + Sync {
    fn deliver(&self, target: &CrashEventTarget, event: &PluginCrashedEvent)
        -> anyhow::Result<()>;
}

/// Outcome of a crash notification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrashReport {
    pub delivered: usize,
    /// Helpers whose window or document was already gone.
    pub skipped: usize,
    pub failed: usize,
}

impl CrashReport {
    pub fn notified_any(&self) -> bool {
        self.delivered > 0
    }
}

/// Plugin id to crash helper multimap.
///
/// The registry holds a counted reference to each helper purely so it can be
/// notified; it never prolongs a helper past a crash or a disconnect.
#[derive(Default)]
pub struct CrashRegistry {
    helpers: HashMap<PluginId, Vec<Arc<dyn CrashHelper>>>,
}

impl CrashRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `helper` for `plugin_id`. Returns `false` if it was already
    /// registered for that plugin.
    pub fn connect(&mut self, plugin_id: PluginId, helper: Arc<dyn CrashHelper>) -> bool {
        let helpers = self.helpers.entry(plugin_id).or_default();
        if helpers.iter().any(|existing| same_helper(existing, &helper)) {
            return false;
        }
        helpers.push(helper);
        true
    }

    /// Removes `helper` from every plugin it was registered for and returns
    /// how many registrations were dropped.
    pub fn disconnect(&mut self, helper: &Arc<dyn CrashHelper>) -> usize {
        let mut removed = 0;
        self.helpers.retain(|_, helpers| {
            let before = helpers.len();
            helpers.retain(|existing| !same_helper(existing, helper));
            removed += before - helpers.len();
            !helpers.is_empty()
        });
        removed
    }

    /// Takes every helper registered for `plugin_id` out of the registry.
    pub fn take(&mut self, plugin_id: PluginId) -> Option<Vec<Arc<dyn CrashHelper>>> {
        self.helpers.remove(&plugin_id)
    }

    pub fn helper_count(&self, plugin_id: PluginId) -> usize {
        self.helpers.get(&plugin_id).map_or(0, Vec::len)
    }

    pub fn contains_plugin(&self, plugin_id: PluginId) -> bool {
        self.helpers.contains_key(&plugin_id)
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }
}

impl std::fmt::Debug for CrashRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<PluginId, usize> = self
            .helpers
            .iter()
            .map(|(id, helpers)| (*id, helpers.len()))
            .collect();
        f.debug_struct("CrashRegistry")
            .field("helpers", &counts)
            .finish()
    }
}

fn same_helper(a: &Arc<dyn CrashHelper>, b: &Arc<dyn CrashHelper>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// Sends a crash event for `plugin_id` to each helper's window.
///
/// A helper without a live window or document is skipped and a failed delivery
/// is logged; neither stops the remaining helpers from being notified.
pub fn notify_crash(
    helpers: &[Arc<dyn CrashHelper>],
    plugin_id: PluginId,
    plugin_name: &str,
    sink: &dyn CrashEventSink,
) -> CrashReport {
    let mut report = CrashReport::default();
    for helper in helpers {
        let Some(target) = helper.crash_event_target() else {
            warn!(%plugin_id, "crash helper has no window; skipping");
            report.skipped += 1;
            continue;
        };
        if target.document_id.is_none() {
            warn!(
                %plugin_id,
                window = target.window_id,
                "crash helper window has no document; skipping"
            );
            report.skipped += 1;
            continue;
        }

        let event = PluginCrashedEvent::new(plugin_id, plugin_name);
        match sink.deliver(&target, &event) {
            Ok(()) => {
                debug!(%plugin_id, window = target.window_id, "delivered plugin crash event");
                report.delivered += 1;
            }
            Err(err) => {
                warn!(
                    %plugin_id,
                    window = target.window_id,
                    "failed to deliver plugin crash event: {err:#}"
                );
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;

    struct FixedHelper(Option<CrashEventTarget>);

    impl CrashHelper for FixedHelper {
        fn crash_event_target(&self) -> Option<CrashEventTarget> {
            self.0
        }
    }

    fn helper(window_id: u64) -> Arc<dyn CrashHelper> {
        Arc::new(FixedHelper(Some(CrashEventTarget {
            window_id,
            document_id: Some(window_id * 10),
        })))
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(u64, PluginCrashedEvent)>>,
        reject_window: Option<u64>,
    }

    impl CrashEventSink for RecordingSink {
        fn deliver(
            &self,
            target: &CrashEventTarget,
            event: &PluginCrashedEvent,
        ) -> anyhow::Result<()> {
            if Some(target.window_id) == self.reject_window {
                bail!("window {} refused the event", target.window_id);
            }
            self.delivered.lock().push((target.window_id, event.clone()));
            Ok(())
        }
    }

    #[test]
    fn connect_is_idempotent_per_plugin() {
        let mut registry = CrashRegistry::new();
        let listener = helper(1);
        assert!(registry.connect(PluginId(3), Arc::clone(&listener)));
        assert!(!registry.connect(PluginId(3), Arc::clone(&listener)));
        assert_eq!(registry.helper_count(PluginId(3)), 1);

        assert!(registry.connect(PluginId(4), listener));
        assert_eq!(registry.helper_count(PluginId(4)), 1);
    }

    #[test]
    fn disconnect_removes_helper_everywhere_and_prunes_empty_sets() {
        let mut registry = CrashRegistry::new();
        let listener = helper(1);
        let other = helper(2);
        registry.connect(PluginId(1), Arc::clone(&listener));
        registry.connect(PluginId(2), Arc::clone(&listener));
        registry.connect(PluginId(2), Arc::clone(&other));

        assert_eq!(registry.disconnect(&listener), 2);
        assert!(!registry.contains_plugin(PluginId(1)));
        assert_eq!(registry.helper_count(PluginId(2)), 1);

        assert_eq!(registry.disconnect(&listener), 0);
        assert_eq!(registry.disconnect(&other), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn take_empties_the_plugin_entry() {
        let mut registry = CrashRegistry::new();
        registry.connect(PluginId(7), helper(1));
        let taken = registry.take(PluginId(7)).unwrap();
        assert_eq!(taken.len(), 1);
        assert!(registry.take(PluginId(7)).is_none());
    }

    #[test]
    fn notify_skips_dead_targets_and_survives_delivery_failures() {
        let helpers = vec![
            helper(1),
            Arc::new(FixedHelper(None)) as Arc<dyn CrashHelper>,
            Arc::new(FixedHelper(Some(CrashEventTarget {
                window_id: 5,
                document_id: None,
            }))) as Arc<dyn CrashHelper>,
            helper(2),
            helper(3),
        ];
        let sink = RecordingSink {
            reject_window: Some(2),
            ..Default::default()
        };

        let report = notify_crash(&helpers, PluginId(7), "videoPlugin", &sink);

        assert_eq!(
            report,
            CrashReport {
                delivered: 2,
                skipped: 2,
                failed: 1,
            }
        );
        let delivered = sink.delivered.lock();
        let windows: Vec<u64> = delivered.iter().map(|(window, _)| *window).collect();
        assert_eq!(windows, vec![1, 3]);
        assert_eq!(delivered[0].1, PluginCrashedEvent::new(PluginId(7), "videoPlugin"));
    }

    #[test]
    fn crash_event_serializes_like_a_dom_event_init() {
        let event = PluginCrashedEvent::new(PluginId(7), "videoPlugin");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PluginCrashed");
        assert_eq!(json["pluginId"], 7);
        assert_eq!(json["pluginName"], "videoPlugin");
        assert_eq!(json["submittedCrashReport"], false);
        assert_eq!(json["gmpPlugin"], true);
    }
}
