#![allow(dead_code)]

//! Shared test support: a scriptable in-memory portal fetcher.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tenderscrape::config::Portal;
use tenderscrape::fetch::{
    DepartmentInfo, DepartmentListing, FetchError, PortalFetcher, RawTenderRow,
};

/// Build a department row.
pub fn dept(s_no: &str, name: &str, count: &str) -> DepartmentInfo {
    DepartmentInfo {
        s_no: s_no.to_string(),
        name: name.to_string(),
        count_text: count.to_string(),
        direct_url: format!("https://portal.test/app?component=list&dept={s_no}"),
    }
}

/// Build a tender row whose title carries a bracketed NIC id.
pub fn tender_row(id: &str, closing: &str) -> RawTenderRow {
    RawTenderRow {
        s_no: "1".to_string(),
        published_date: "01/12/2026".to_string(),
        closing_date: closing.to_string(),
        opening_date: "01/01/2027 10:00".to_string(),
        title_ref: format!("Works package [{id}]"),
        organisation_chain: "State PWD".to_string(),
        direct_url: format!("https://portal.test/app?component=detail&id={id}"),
        status_url: String::new(),
    }
}

type FetchHook = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Per-portal script: a department listing plus rows for each department.
#[derive(Default, Clone)]
pub struct PortalScript {
    pub departments: Vec<DepartmentInfo>,
    pub rows: HashMap<String, Vec<RawTenderRow>>,
}

impl PortalScript {
    pub fn new(departments: Vec<DepartmentInfo>) -> Self {
        Self {
            departments,
            rows: HashMap::new(),
        }
    }

    pub fn with_rows(mut self, dept_name: &str, rows: Vec<RawTenderRow>) -> Self {
        self.rows.insert(dept_name.to_lowercase(), rows);
        self
    }
}

/// Scriptable fetcher: fixed listings per portal, optional scripted
/// failures, call counters, and a hook invoked on each department fetch.
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, PortalScript>>,
    /// Errors returned (and consumed) before list fetches succeed, per
    /// portal.
    list_failures: Mutex<HashMap<String, Vec<FetchError>>>,
    pub list_calls: AtomicUsize,
    pub row_calls: AtomicUsize,
    pub reinit_calls: AtomicUsize,
    on_department_fetch: Mutex<Option<FetchHook>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            list_failures: Mutex::new(HashMap::new()),
            list_calls: AtomicUsize::new(0),
            row_calls: AtomicUsize::new(0),
            reinit_calls: AtomicUsize::new(0),
            on_department_fetch: Mutex::new(None),
        }
    }

    pub fn script_portal(&self, portal_name: &str, script: PortalScript) {
        self.scripts
            .lock()
            .insert(portal_name.to_lowercase(), script);
    }

    /// Queue an error for the next department-list fetch of a portal.
    pub fn fail_next_list(&self, portal_name: &str, error: FetchError) {
        self.list_failures
            .lock()
            .entry(portal_name.to_lowercase())
            .or_default()
            .push(error);
    }

    /// Invoke `hook(portal, department)` on every department-rows fetch.
    pub fn set_department_hook(&self, hook: FetchHook) {
        *self.on_department_fetch.lock() = Some(hook);
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl PortalFetcher for ScriptedFetcher {
    async fn fetch_department_list(
        &self,
        portal: &Portal,
    ) -> Result<DepartmentListing, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let key = portal.name.to_lowercase();

        if let Some(queued) = self.list_failures.lock().get_mut(&key) {
            if !queued.is_empty() {
                return Err(queued.remove(0));
            }
        }

        let script = self
            .scripts
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_default();
        let expected_total = script
            .departments
            .iter()
            .filter_map(DepartmentInfo::advertised_count)
            .sum();
        Ok(DepartmentListing {
            departments: script.departments,
            expected_total,
        })
    }

    async fn fetch_department_rows(
        &self,
        portal: &Portal,
        department: &DepartmentInfo,
    ) -> Result<Vec<RawTenderRow>, FetchError> {
        self.row_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &*self.on_department_fetch.lock() {
            hook(&portal.name, &department.name);
        }
        let rows = self
            .scripts
            .lock()
            .get(&portal.name.to_lowercase())
            .and_then(|script| script.rows.get(&department.name.to_lowercase()).cloned())
            .unwrap_or_default();
        Ok(rows)
    }

    async fn reinitialize(&self) -> Result<(), FetchError> {
        self.reinit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
