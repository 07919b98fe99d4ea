//! Resource release capabilities for items owned by a change stream.

use crate::error::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// An item holding resources that must be released once it leaves the stream.
pub trait Disposable {
    /// Releases the item's resources.
    fn dispose(&self) -> Result<()>;

    /// Returns true when `other` holds the very same resource, so replacing
    /// one with the other releases nothing.
    fn same_resource(&self, _other: &Self) -> bool {
        false
    }
}

/// An item whose resources are released asynchronously.
pub trait AsyncDisposable {
    /// Starts releasing the item's resources.
    ///
    /// The returned future may already be complete; callers check before
    /// handing it to a runtime.
    fn dispose_async(&self) -> BoxFuture<'static, Result<()>>;

    /// Returns true when `other` holds the very same resource.
    fn same_resource(&self, _other: &Self) -> bool {
        false
    }
}

impl<T: Disposable + ?Sized> Disposable for Arc<T> {
    fn dispose(&self) -> Result<()> {
        (**self).dispose()
    }

    fn same_resource(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other) || Disposable::same_resource(&**self, &**other)
    }
}

impl<T: AsyncDisposable + ?Sized> AsyncDisposable for Arc<T> {
    fn dispose_async(&self) -> BoxFuture<'static, Result<()>> {
        (**self).dispose_async()
    }

    fn same_resource(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other) || AsyncDisposable::same_resource(&**self, &**other)
    }
}
