//! This contains test scenarios that a given [PathInfoService] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all services we want to test
//! against, and then apply this template to all test functions.

use nix_compat::store_path::StorePath;
use rstest::*;
use rstest_reuse::{self, *};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{PathInfo, PathInfoService};
use crate::Error;

pub fn make_path_info_service(uri: &str) -> Arc<dyn PathInfoService> {
    crate::pathinfoservice::from_addr(uri).unwrap()
}

fn sp(s: &str) -> StorePath {
    s.parse().unwrap()
}

const DEP: &str = "00bgd045z0d4icpbc2yyz4gx48ak44la-dep";
const APP: &str = "00bgd045z0d4icpbc2yyz4gx48ak44lb-app";
const APP_DRV: &str = "00bgd045z0d4icpbc2yyz4gx48ak44lc-app.drv";

#[template]
#[rstest]
#[case::memory(make_path_info_service("memory://"))]
#[case::redb(make_path_info_service("redb://"))]
pub fn path_info_services(#[case] svc: Arc<dyn PathInfoService>) {}

/// Trying to get a non-existent PathInfo should return Ok(None).
#[apply(path_info_services)]
fn not_found(svc: Arc<dyn PathInfoService>) {
    assert!(svc.get(&sp(DEP)).expect("must succeed").is_none());
    assert!(!svc.is_valid_path(&sp(DEP)).expect("must succeed"));
}

/// Put a PathInfo into the store, get it back.
#[apply(path_info_services)]
fn put_get(svc: Arc<dyn PathInfoService>) {
    let mut path_info = PathInfo::new(sp(DEP));
    path_info.nar_size = 42;

    svc.put(path_info.clone()).expect("must succeed");
    assert_eq!(Some(path_info), svc.get(&sp(DEP)).expect("must succeed"));
}

/// Referrers and references are maintained on put and invalidate.
#[apply(path_info_services)]
fn referrers(svc: Arc<dyn PathInfoService>) {
    svc.put(PathInfo::new(sp(DEP))).unwrap();

    let mut app = PathInfo::new(sp(APP));
    app.references = BTreeSet::from([sp(DEP), sp(APP)]);
    svc.put(app).unwrap();

    assert_eq!(
        BTreeSet::from([sp(APP)]),
        svc.query_referrers(&sp(DEP)).unwrap()
    );
    assert_eq!(
        BTreeSet::from([sp(DEP), sp(APP)]),
        svc.query_references(&sp(APP)).unwrap()
    );

    // dep is still referred to by app.
    assert!(matches!(
        svc.invalidate(&sp(DEP)),
        Err(Error::PathInUse(_, _))
    ));

    // self-references don't prevent invalidation.
    svc.invalidate(&sp(APP)).expect("must succeed");
    assert!(svc.query_referrers(&sp(DEP)).unwrap().is_empty());
    svc.invalidate(&sp(DEP)).expect("must succeed");
    assert!(svc.list().unwrap().is_empty());
}

/// References need to be valid at registration time.
#[apply(path_info_services)]
fn dangling_reference(svc: Arc<dyn PathInfoService>) {
    let mut app = PathInfo::new(sp(APP));
    app.references = BTreeSet::from([sp(DEP)]);

    assert!(matches!(svc.put(app), Err(Error::InvalidRequest(_))));
}

/// Derivation outputs can be looked up in both directions.
#[apply(path_info_services)]
fn derivation_outputs(svc: Arc<dyn PathInfoService>) {
    let mut drv = PathInfo::new(sp(APP_DRV));
    drv.outputs = BTreeMap::from([("out".to_string(), sp(APP))]);
    svc.put(drv).unwrap();

    let mut app = PathInfo::new(sp(APP));
    app.deriver = Some(sp(APP_DRV));
    svc.put(app).unwrap();

    assert_eq!(
        BTreeMap::from([("out".to_string(), Some(sp(APP)))]),
        svc.query_partial_derivation_output_map(&sp(APP_DRV))
            .unwrap()
    );
    assert_eq!(
        BTreeSet::from([sp(APP_DRV)]),
        svc.query_valid_derivers(&sp(APP)).unwrap()
    );
    assert_eq!(2, svc.list().unwrap().len());
}

/// Only derivations may carry outputs.
#[apply(path_info_services)]
fn outputs_on_non_derivation(svc: Arc<dyn PathInfoService>) {
    let mut app = PathInfo::new(sp(APP));
    app.outputs = BTreeMap::from([("out".to_string(), sp(DEP))]);

    assert!(svc.put(app).is_err());
}
