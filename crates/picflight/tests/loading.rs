// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for loading images into targets.

mod common;

use std::{cell::RefCell, rc::Rc, sync::Arc, time::Duration};

use common::{FakeNetwork, FakeView, Shown, TIMEOUT, image_loader, url};
use picflight::{
    DataSource, LoadFailure, Model, Placeholder, RequestListener, RequestOptions, Resource, Transition, TransitionOptions,
};

const FADE: Duration = Duration::from_millis(150);

#[test]
fn identical_loads_share_one_fetch() {
    let network = Arc::new(FakeNetwork::down());
    let images = image_loader(&network, 1 << 20);
    let screen = images.request_manager();
    let (first, second) = (FakeView::new(), FakeView::new());

    screen.load(url("cat")).into_target(first.as_target()).unwrap();
    screen.load(url("cat")).into_target(second.as_target()).unwrap();
    assert_eq!(images.engine().pending_loads(), 1);

    network.connect();
    assert!(images.engine().run_until_idle(TIMEOUT).unwrap());

    assert_eq!(network.fetched(), ["https://images.example.com/cat.png"]);
    assert!(Arc::ptr_eq(&first.image().unwrap(), &second.image().unwrap()));
    assert_eq!(images.engine().active_resources(), 1);
}

#[test]
fn released_image_is_served_from_memory_without_a_transition() {
    let network = Arc::new(FakeNetwork::up());
    let images = image_loader(&network, 1 << 20);
    let screen = images.request_manager();

    let first = FakeView::new();
    screen
        .load(url("cat"))
        .transition(TransitionOptions::CrossFade(FADE))
        .into_target(first.as_target())
        .unwrap();
    images.engine().run_until_idle(TIMEOUT).unwrap();
    assert_eq!(
        first.shown(),
        [
            Shown::Placeholder(Some(Placeholder::Color(1))),
            Shown::Image(Some(Transition::CrossFade(FADE))),
        ]
    );

    screen.clear(&first.as_target()).unwrap();
    assert_eq!(images.engine().active_resources(), 0);
    assert_eq!(images.engine().memory_cache_len(), 1);

    let second = FakeView::new();
    screen
        .load(url("cat"))
        .transition(TransitionOptions::CrossFade(FADE))
        .into_target(second.as_target())
        .unwrap();
    assert_eq!(second.shown(), [Shown::Image(None)]);
    assert_eq!(images.engine().memory_cache_len(), 0);
    assert_eq!(network.fetched().len(), 1);
}

#[test]
fn cleared_load_never_reaches_the_view() {
    let network = Arc::new(FakeNetwork::down());
    let images = image_loader(&network, 1 << 20);
    let screen = images.request_manager();
    let view = FakeView::new();

    screen.load(url("cat")).into_target(view.as_target()).unwrap();
    screen.clear(&view.as_target()).unwrap();

    network.connect();
    assert!(images.engine().run_until_idle(TIMEOUT).unwrap());
    assert_eq!(
        view.shown(),
        [
            Shown::Placeholder(Some(Placeholder::Color(1))),
            Shown::Cleared(Some(Placeholder::Color(1))),
        ]
    );
    assert!(view.image().is_none());
    assert_eq!(images.engine().active_resources(), 0);
    assert_eq!(images.engine().memory_cache_len(), 0);
}

#[test]
fn evicted_bitmaps_are_decoded_into_again() {
    let network = Arc::new(FakeNetwork::up());
    // Room for exactly one 10x10 ARGB bitmap.
    let images = image_loader(&network, 400);
    let screen = images.request_manager();
    let view = FakeView::new();

    for name in ["a", "b"] {
        screen.load(url(name)).into_target(view.as_target()).unwrap();
        images.engine().run_until_idle(TIMEOUT).unwrap();
        screen.clear(&view.as_target()).unwrap();
    }
    assert_eq!(images.engine().memory_cache_len(), 1);
    assert_eq!(images.reuse_pool().len(), 1);

    screen.load(url("c")).into_target(view.as_target()).unwrap();
    images.engine().run_until_idle(TIMEOUT).unwrap();
    assert!(view.image().is_some());
    assert!(images.reuse_pool().is_empty());
    assert_eq!(images.reuse_pool().stats().hits, 1);
}

#[derive(Default)]
struct FailureLog {
    failures: RefCell<Vec<(LoadFailure, Option<Model>)>>,
}

impl RequestListener for FailureLog {
    fn on_resource_ready(
        &self,
        _resource: &Arc<Resource>,
        _model: Option<&Model>,
        _source: DataSource,
        _is_first_resource: bool,
    ) -> bool {
        false
    }

    fn on_load_failed(&self, failure: &LoadFailure, model: Option<&Model>, _is_first_resource: bool) -> bool {
        self.failures.borrow_mut().push((failure.clone(), model.cloned()));
        false
    }
}

#[test]
fn failed_load_shows_error_and_tells_listeners() {
    let network = Arc::new(FakeNetwork::unreachable());
    let images = image_loader(&network, 1 << 20);
    let screen = images.request_manager();
    let view = FakeView::new();
    let log = Rc::new(FailureLog::default());

    screen
        .load(url("cat"))
        .listener(Rc::clone(&log) as Rc<dyn RequestListener>)
        .into_target(view.as_target())
        .unwrap();
    images.engine().run_until_idle(TIMEOUT).unwrap();

    assert_eq!(
        view.shown(),
        [
            Shown::Placeholder(Some(Placeholder::Color(1))),
            Shown::Error(Some(Placeholder::Color(2))),
        ]
    );
    let failures = log.failures.borrow();
    assert_eq!(failures.len(), 1);
    let (failure, model) = &failures[0];
    assert_eq!(model.as_ref(), Some(&url("cat")));
    assert!(
        failure
            .root_causes()
            .iter()
            .any(|cause| cause.to_string() == "connection refused")
    );
}

#[test]
fn absent_model_fails_without_fetching() {
    let network = Arc::new(FakeNetwork::up());
    let images = image_loader(&network, 1 << 20);
    let screen = images.request_manager();
    let view = FakeView::new();

    screen
        .load(Option::<Model>::None)
        .apply(&RequestOptions::new().fallback(Placeholder::ResourceId(9)))
        .into_target(view.as_target())
        .unwrap();

    assert_eq!(view.shown(), [Shown::Error(Some(Placeholder::ResourceId(9)))]);
    assert!(network.fetched().is_empty());
}
