//! Builds execution descriptors from persisted widget instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::ExecutionDescriptor;
use crate::storage::WidgetInstanceStore;
use crate::widget::{is_structured, parse_properties, CategoryParameter, Dashboard, WidgetInstance};

/// Translates widget instances into [`ExecutionDescriptor`]s and decides
/// whether a descriptor may run.
#[derive(Clone)]
pub struct WidgetExecutionService {
    store: Arc<dyn WidgetInstanceStore>,
    timeout_floor_secs: u64,
    checks: Arc<AtomicU64>,
}

impl WidgetExecutionService {
    pub fn new(store: Arc<dyn WidgetInstanceStore>, timeout_floor_secs: u64) -> Self {
        Self {
            store,
            timeout_floor_secs,
            checks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build the descriptor for one instance.
    ///
    /// Never fails: a missing or unreadable instance yields a placeholder
    /// descriptor, which is not executable.
    pub fn build_descriptor(&self, widget_instance_id: i64) -> ExecutionDescriptor {
        let instance = match self.store.get_instance(widget_instance_id) {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                debug!(widget_instance_id, "widget instance not found, using placeholder");
                WidgetInstance::placeholder(widget_instance_id)
            }
            Err(e) => {
                warn!(widget_instance_id, error = %e, "failed to load widget instance");
                WidgetInstance::placeholder(widget_instance_id)
            }
        };
        self.descriptor_for(&instance)
    }

    pub fn descriptor_for(&self, instance: &WidgetInstance) -> ExecutionDescriptor {
        let widget = &instance.widget;
        let timeout_secs = widget
            .timeout_secs
            .and_then(|t| u64::try_from(t).ok())
            .unwrap_or(self.timeout_floor_secs)
            .max(self.timeout_floor_secs);

        ExecutionDescriptor {
            widget_instance_id: instance.id,
            dashboard_id: instance.dashboard_id,
            dashboard_token: instance.dashboard_token.clone(),
            script: widget.script.clone(),
            merged_config: merge_configuration(
                instance.configuration.as_deref(),
                &widget.category_parameters,
            ),
            previous_output: instance.data.clone(),
            delay_secs: widget.delay_secs,
            timeout_secs,
            current_state: instance.state,
            last_success_at: instance.last_success_at,
            params: widget.params.clone(),
        }
    }

    /// One descriptor per widget instance across every grid of a dashboard.
    pub fn build_descriptors_for_dashboard(&self, dashboard_id: i64) -> Vec<ExecutionDescriptor> {
        match self.store.get_dashboard(dashboard_id) {
            Ok(Some(dashboard)) => self.build_descriptors(&dashboard),
            Ok(None) => {
                debug!(dashboard_id, "dashboard not found");
                Vec::new()
            }
            Err(e) => {
                warn!(dashboard_id, error = %e, "failed to load dashboard");
                Vec::new()
            }
        }
    }

    pub fn build_descriptors(&self, dashboard: &Dashboard) -> Vec<ExecutionDescriptor> {
        dashboard
            .widget_instance_ids()
            .map(|id| self.build_descriptor(id))
            .collect()
    }

    /// Executability checks performed so far, across clones of the service.
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Whether a descriptor may enter the pools. Reasons for refusal are
    /// logged at debug level.
    pub fn is_executable(&self, descriptor: &ExecutionDescriptor) -> bool {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let id = descriptor.widget_instance_id;

        if descriptor.script.as_deref().map_or(true, |s| s.trim().is_empty()) {
            debug!(widget_instance_id = id, "not executable: script is blank");
            return false;
        }

        if let Some(previous) = descriptor
            .previous_output
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            if !is_structured(previous) {
                debug!(
                    widget_instance_id = id,
                    "not executable: previous output is not valid JSON"
                );
                return false;
            }
        }

        match descriptor.delay_secs {
            Some(delay) if delay >= 0 => true,
            _ => {
                debug!(
                    widget_instance_id = id,
                    delay = ?descriptor.delay_secs,
                    "not executable: invalid delay"
                );
                false
            }
        }
    }
}

/// Overlay category parameters onto an instance configuration.
///
/// Instance keys win. Category keys that are missing are appended as
/// `key=value` lines, each terminated by a newline.
pub fn merge_configuration(instance: Option<&str>, category: &[CategoryParameter]) -> String {
    let mut merged = instance.unwrap_or_default().to_string();
    let existing = parse_properties(&merged);

    for param in category {
        if existing.contains_key(&param.key) {
            continue;
        }
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(&param.key);
        merged.push('=');
        merged.push_str(&param.value);
        merged.push('\n');
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::widget::{DashboardGrid, DataType, Widget, WidgetState};

    fn param(key: &str, value: &str) -> CategoryParameter {
        CategoryParameter {
            key: key.into(),
            value: value.into(),
            data_type: DataType::Text,
        }
    }

    fn executable() -> ExecutionDescriptor {
        ExecutionDescriptor {
            widget_instance_id: 1,
            script: Some("echo '{}'".into()),
            delay_secs: Some(30),
            timeout_secs: 60,
            ..Default::default()
        }
    }

    fn service(store: &MemoryStore) -> WidgetExecutionService {
        WidgetExecutionService::new(Arc::new(store.clone()), 60)
    }

    #[test]
    fn test_merge_instance_keys_win() {
        let merged = merge_configuration(
            Some("SURI_HOST=a.example"),
            &[param("SURI_HOST", "global"), param("SURI_TOKEN", "t0k")],
        );
        assert_eq!(merged, "SURI_HOST=a.example\nSURI_TOKEN=t0k\n");
    }

    #[test]
    fn test_merge_without_instance_config() {
        assert_eq!(merge_configuration(None, &[param("K", "v")]), "K=v\n");
        assert_eq!(merge_configuration(Some("A=1\n"), &[]), "A=1\n");
    }

    #[test]
    fn test_is_executable_rules() {
        let store = MemoryStore::new();
        let service = service(&store);
        assert!(service.is_executable(&executable()));

        let blank = ExecutionDescriptor { script: Some("   ".into()), ..executable() };
        assert!(!service.is_executable(&blank));

        let missing = ExecutionDescriptor { script: None, ..executable() };
        assert!(!service.is_executable(&missing));

        let negative = ExecutionDescriptor { delay_secs: Some(-1), ..executable() };
        assert!(!service.is_executable(&negative));

        let no_delay = ExecutionDescriptor { delay_secs: None, ..executable() };
        assert!(!service.is_executable(&no_delay));

        let broken = ExecutionDescriptor { previous_output: Some("{oops".into()), ..executable() };
        assert!(!service.is_executable(&broken));

        let fine = ExecutionDescriptor {
            previous_output: Some(r#"{"n":1}"#.into()),
            ..executable()
        };
        assert!(service.is_executable(&fine));
    }

    #[test]
    fn test_build_descriptor_for_missing_instance_is_placeholder() {
        let store = MemoryStore::new();
        let service = service(&store);
        let descriptor = service.build_descriptor(42);
        assert_eq!(descriptor.widget_instance_id, 42);
        assert!(descriptor.script.is_none());
        assert!(!service.is_executable(&descriptor));
    }

    #[test]
    fn test_build_descriptor_copies_widget_fields() {
        let store = MemoryStore::new();
        store.insert_instance(WidgetInstance {
            id: 5,
            dashboard_id: 2,
            dashboard_token: "tv".into(),
            widget: Widget {
                script: Some("run".into()),
                delay_secs: Some(15),
                timeout_secs: Some(10),
                category_parameters: vec![param("G", "1")],
                ..Default::default()
            },
            configuration: Some("L=2".into()),
            state: WidgetState::Warning,
            data: Some(r#"{"x":1}"#.into()),
            ..Default::default()
        });

        let descriptor = service(&store).build_descriptor(5);
        assert_eq!(descriptor.dashboard_id, 2);
        assert_eq!(descriptor.dashboard_token, "tv");
        assert_eq!(descriptor.merged_config, "L=2\nG=1\n");
        assert_eq!(descriptor.delay_secs, Some(15));
        assert_eq!(descriptor.timeout_secs, 60);
        assert_eq!(descriptor.current_state, WidgetState::Warning);
        assert_eq!(descriptor.previous_output.as_deref(), Some(r#"{"x":1}"#));
    }

    #[test]
    fn test_descriptors_for_dashboard_cover_all_grids() {
        let store = MemoryStore::new();
        store.insert_dashboard(Dashboard {
            id: 3,
            token: "wall".into(),
            name: "Wall".into(),
            grids: vec![
                DashboardGrid { id: 1, widget_instance_ids: vec![10] },
                DashboardGrid { id: 2, widget_instance_ids: vec![11, 12] },
            ],
        });

        let descriptors = service(&store).build_descriptors_for_dashboard(3);
        let ids: Vec<i64> = descriptors.iter().map(|d| d.widget_instance_id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert!(service(&store).build_descriptors_for_dashboard(99).is_empty());
    }
}
