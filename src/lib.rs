// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Hardlink based folder mirroring.
//!
//! Linkmirror keeps sets of folders, called __mirror groups__, in agreement
//! through hardlinks. A file added to one member folder appears as a hardlink
//! in every other member. Removing a file asks how far the removal should
//! reach. Files are matched by their [`FileIdentity`] rather than by name, so
//! mirrored folders are free to call the same data by different names.
//!
//! The crate is layered leaf first:
//!
//! - [`identity`] resolves paths to file identities.
//! - [`native`] is the filesystem contract everything else goes through.
//! - [`link`] creates, removes, and enumerates hardlinks.
//! - [`registry`] persists mirror groups.
//! - [`sync`] propagates changes across a group.
//! - [`watch`] turns filesystem notifications into debounced events.
//! - [`search`] intersects arbitrary folders by identity.
//! - [`content`] finds folder trees that hold the same data.

pub mod config;
pub mod content;
pub mod identity;
pub mod link;
pub mod native;
pub mod path;
pub mod registry;
pub mod search;
pub mod sync;
pub mod watch;

pub use identity::FileIdentity;
pub use link::LinkOperator;
pub use native::{LocalFs, NativeFs};
pub use registry::{GroupId, MirrorGroup, Registry};
pub use search::SearchEngine;
pub use sync::SyncEngine;
