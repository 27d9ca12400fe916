// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    any::Any,
    cell::RefCell,
    fmt, ptr,
    rc::{Rc, Weak},
};

use crate::UsageError;

use super::{Request, RequestCoordinator};

/// Runs a low-resolution thumbnail request alongside a full request on the same target.
///
/// The thumbnail may set its resource only until the full request has set one, and only the
/// full request shows placeholders. Once the full request succeeds, an unfinished thumbnail is
/// cleared. Coordinators nest: a parent coordinator can veto both requests.
pub struct ThumbnailRequestCoordinator {
    parent: Option<Weak<dyn RequestCoordinator>>,
    requests: RefCell<Option<Pair>>,
}

struct Pair {
    full: Rc<dyn Request>,
    thumb: Rc<dyn Request>,
}

impl ThumbnailRequestCoordinator {
    /// A coordinator with no requests yet, optionally nested under `parent`.
    #[must_use]
    pub fn new(parent: Option<Weak<dyn RequestCoordinator>>) -> Rc<Self> {
        Rc::new(Self {
            parent,
            requests: RefCell::new(None),
        })
    }

    /// Sets the coordinated requests. Both must have been built with this coordinator.
    pub fn set_requests(&self, full: Rc<dyn Request>, thumb: Rc<dyn Request>) {
        *self.requests.borrow_mut() = Some(Pair { full, thumb });
    }

    fn pair(&self) -> Option<(Rc<dyn Request>, Rc<dyn Request>)> {
        self.requests
            .borrow()
            .as_ref()
            .map(|pair| (Rc::clone(&pair.full), Rc::clone(&pair.thumb)))
    }

    fn parent(&self) -> Option<Rc<dyn RequestCoordinator>> {
        self.parent.as_ref()?.upgrade()
    }

    fn is_full(&self, request: &dyn Request) -> bool {
        self.requests
            .borrow()
            .as_ref()
            .is_some_and(|pair| ptr::addr_eq(ptr::from_ref(request), Rc::as_ptr(&pair.full)))
    }

    fn is_thumb(&self, request: &dyn Request) -> bool {
        self.requests
            .borrow()
            .as_ref()
            .is_some_and(|pair| ptr::addr_eq(ptr::from_ref(request), Rc::as_ptr(&pair.thumb)))
    }

    fn full_is_resource_set(&self) -> bool {
        self.pair().is_some_and(|(full, _)| full.is_resource_set())
    }
}

impl RequestCoordinator for ThumbnailRequestCoordinator {
    fn can_set_image(&self, request: &dyn Request) -> bool {
        self.parent().is_none_or(|parent| parent.can_set_image(self))
            && (self.is_full(request) || !self.full_is_resource_set())
    }

    fn can_notify_status_changed(&self, request: &dyn Request) -> bool {
        self.parent()
            .is_none_or(|parent| parent.can_notify_status_changed(self))
            && self.is_full(request)
            && !self.is_any_resource_set()
    }

    fn is_any_resource_set(&self) -> bool {
        self.parent().is_some_and(|parent| parent.is_any_resource_set()) || self.is_resource_set()
    }

    fn on_request_success(&self, request: &dyn Request) -> Result<(), UsageError> {
        if self.is_thumb(request) {
            return Ok(());
        }
        if let Some(parent) = self.parent() {
            parent.on_request_success(self)?;
        }
        match self.pair() {
            Some((_, thumb)) if !thumb.is_complete() => thumb.clear(),
            _ => Ok(()),
        }
    }
}

impl Request for ThumbnailRequestCoordinator {
    fn begin(&self) -> Result<(), UsageError> {
        let Some((full, thumb)) = self.pair() else {
            return Ok(());
        };
        if !full.is_complete() && !thumb.is_running() {
            thumb.begin()?;
        }
        if !full.is_running() {
            full.begin()?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), UsageError> {
        let Some((full, thumb)) = self.pair() else {
            return Ok(());
        };
        thumb.clear()?;
        full.clear()
    }

    fn pause(&self) -> Result<(), UsageError> {
        let Some((full, thumb)) = self.pair() else {
            return Ok(());
        };
        full.pause()?;
        thumb.pause()
    }

    fn recycle(&self) -> Result<(), UsageError> {
        let Some((full, thumb)) = self.pair() else {
            return Ok(());
        };
        full.recycle()?;
        thumb.recycle()
    }

    fn is_running(&self) -> bool {
        self.pair().is_some_and(|(full, _)| full.is_running())
    }

    fn is_complete(&self) -> bool {
        self.pair().is_some_and(|(full, thumb)| full.is_complete() || thumb.is_complete())
    }

    fn is_resource_set(&self) -> bool {
        self.pair()
            .is_some_and(|(full, thumb)| full.is_resource_set() || thumb.is_resource_set())
    }

    fn is_cancelled(&self) -> bool {
        self.pair().is_some_and(|(full, _)| full.is_cancelled())
    }

    fn is_cleared(&self) -> bool {
        self.pair().is_some_and(|(full, _)| full.is_cleared())
    }

    fn is_failed(&self) -> bool {
        self.pair().is_some_and(|(full, _)| full.is_failed())
    }

    fn is_paused(&self) -> bool {
        self.pair().is_some_and(|(full, _)| full.is_paused())
    }

    fn is_equivalent_to(&self, other: &dyn Request) -> bool {
        let Some(other) = other.as_any().downcast_ref::<Self>() else {
            return false;
        };
        match (self.pair(), other.pair()) {
            (Some((full, thumb)), Some((other_full, other_thumb))) => {
                full.is_equivalent_to(&*other_full) && thumb.is_equivalent_to(&*other_thumb)
            }
            (None, None) => true,
            _ => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for ThumbnailRequestCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailRequestCoordinator")
            .field("has_parent", &self.parent.is_some())
            .field("has_requests", &self.requests.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, sync::Arc, time::Duration};

    use super::*;
    use crate::{
        Dimension, Engine, Model, RequestConfig, RequestOptions, SingleRequest, Target,
        testing::{GatedLoader, RecordingTarget, TargetEvent, test_engine},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct StubRequest {
        resource_set: Cell<bool>,
        cleared: Cell<bool>,
    }

    impl Request for StubRequest {
        fn begin(&self) -> Result<(), UsageError> {
            Ok(())
        }

        fn clear(&self) -> Result<(), UsageError> {
            self.cleared.set(true);
            Ok(())
        }

        fn pause(&self) -> Result<(), UsageError> {
            Ok(())
        }

        fn recycle(&self) -> Result<(), UsageError> {
            Ok(())
        }

        fn is_running(&self) -> bool {
            false
        }

        fn is_complete(&self) -> bool {
            self.resource_set.get()
        }

        fn is_resource_set(&self) -> bool {
            self.resource_set.get()
        }

        fn is_cancelled(&self) -> bool {
            false
        }

        fn is_cleared(&self) -> bool {
            self.cleared.get()
        }

        fn is_failed(&self) -> bool {
            false
        }

        fn is_paused(&self) -> bool {
            false
        }

        fn is_equivalent_to(&self, _other: &dyn Request) -> bool {
            false
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Veto;

    impl RequestCoordinator for Veto {
        fn can_set_image(&self, _request: &dyn Request) -> bool {
            false
        }

        fn can_notify_status_changed(&self, _request: &dyn Request) -> bool {
            false
        }

        fn is_any_resource_set(&self) -> bool {
            false
        }

        fn on_request_success(&self, _request: &dyn Request) -> Result<(), UsageError> {
            Ok(())
        }
    }

    fn stubs() -> (Rc<ThumbnailRequestCoordinator>, Rc<StubRequest>, Rc<StubRequest>) {
        let coordinator = ThumbnailRequestCoordinator::new(None);
        let full = Rc::new(StubRequest::default());
        let thumb = Rc::new(StubRequest::default());
        coordinator.set_requests(Rc::clone(&full) as Rc<dyn Request>, Rc::clone(&thumb) as Rc<dyn Request>);
        (coordinator, full, thumb)
    }

    #[test]
    fn thumbnail_yields_once_full_is_set() {
        let (coordinator, full, thumb) = stubs();
        assert!(coordinator.can_set_image(&*full));
        assert!(coordinator.can_set_image(&*thumb));
        assert!(coordinator.can_notify_status_changed(&*full));
        assert!(!coordinator.can_notify_status_changed(&*thumb));

        full.resource_set.set(true);
        assert!(coordinator.can_set_image(&*full));
        assert!(!coordinator.can_set_image(&*thumb));
        assert!(!coordinator.can_notify_status_changed(&*full));
        assert!(coordinator.is_any_resource_set());
    }

    #[test]
    fn thumbnail_resource_silences_placeholders() {
        let (coordinator, full, thumb) = stubs();
        thumb.resource_set.set(true);
        assert!(coordinator.can_set_image(&*full));
        assert!(!coordinator.can_notify_status_changed(&*full));
        assert!(coordinator.is_complete());
    }

    #[test]
    fn full_success_clears_unfinished_thumbnail() {
        let (coordinator, full, thumb) = stubs();
        coordinator.on_request_success(&*thumb).unwrap();
        assert!(!thumb.cleared.get());

        coordinator.on_request_success(&*full).unwrap();
        assert!(thumb.cleared.get());
    }

    #[test]
    fn parent_can_veto() {
        let parent: Rc<dyn RequestCoordinator> = Rc::new(Veto);
        let coordinator = ThumbnailRequestCoordinator::new(Some(Rc::downgrade(&parent)));
        let full = Rc::new(StubRequest::default());
        let thumb = Rc::new(StubRequest::default());
        coordinator.set_requests(Rc::clone(&full) as Rc<dyn Request>, Rc::clone(&thumb) as Rc<dyn Request>);

        assert!(!coordinator.can_set_image(&*full));
        assert!(!coordinator.can_notify_status_changed(&*full));
    }

    fn request(
        engine: &Engine,
        target: &Rc<RecordingTarget>,
        coordinator: Option<&Rc<ThumbnailRequestCoordinator>>,
        name: &str,
    ) -> Rc<SingleRequest> {
        SingleRequest::new(RequestConfig {
            options: RequestOptions::new().override_size(Dimension::Pixels(10), Dimension::Pixels(10)),
            coordinator: coordinator.map(|coordinator| Rc::downgrade(coordinator) as Weak<dyn RequestCoordinator>),
            ..RequestConfig::new(
                engine.clone(),
                Some(Model::Url(format!("https://example.com/{name}.png"))),
                Rc::clone(target) as Rc<dyn Target>,
            )
        })
    }

    fn warm(engine: &Engine, name: &str) {
        let target = Rc::new(RecordingTarget::default());
        let request = request(engine, &target, None, name);
        request.begin().unwrap();
        engine.run_until_idle(TIMEOUT).unwrap();
        request.clear().unwrap();
        assert!(engine.memory_cache_len() > 0);
    }

    #[test]
    fn cached_thumbnail_shows_until_full_arrives() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        warm(&engine, "thumb");
        loader.close();

        let target = Rc::new(RecordingTarget::default());
        let coordinator = ThumbnailRequestCoordinator::new(None);
        let full = request(&engine, &target, Some(&coordinator), "full");
        let thumb = request(&engine, &target, Some(&coordinator), "thumb");
        coordinator.set_requests(Rc::clone(&full) as Rc<dyn Request>, Rc::clone(&thumb) as Rc<dyn Request>);

        coordinator.begin().unwrap();
        assert!(thumb.is_complete());
        assert!(full.is_running());
        assert_eq!(target.events(), [TargetEvent::Ready(None)]);

        loader.open();
        engine.run_until_idle(TIMEOUT).unwrap();
        assert!(full.is_complete());
        assert!(thumb.is_complete());
        assert_eq!(target.events(), [TargetEvent::Ready(None), TargetEvent::Ready(None)]);
    }

    #[test]
    fn cached_full_clears_running_thumbnail() {
        let loader = Arc::new(GatedLoader::open_by_default());
        let engine = test_engine(&loader);
        warm(&engine, "full");
        loader.close();

        let target = Rc::new(RecordingTarget::default());
        let coordinator = ThumbnailRequestCoordinator::new(None);
        let full = request(&engine, &target, Some(&coordinator), "full");
        let thumb = request(&engine, &target, Some(&coordinator), "thumb");
        coordinator.set_requests(Rc::clone(&full) as Rc<dyn Request>, Rc::clone(&thumb) as Rc<dyn Request>);

        coordinator.begin().unwrap();
        assert!(full.is_complete());
        assert!(thumb.is_cleared());
        assert_eq!(target.events(), [TargetEvent::Ready(None)]);

        loader.open();
        engine.run_until_idle(TIMEOUT).unwrap();
        assert_eq!(target.events(), [TargetEvent::Ready(None)]);
        assert_eq!(engine.active_resources(), 1);
    }
}
