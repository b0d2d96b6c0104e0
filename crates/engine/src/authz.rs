// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authorization decisions consumed from the policy collaborator

use async_trait::async_trait;
use ot_core::{Run, UserId};

/// Decides whether a subject may apply a run
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn can_apply(&self, run: &Run, user: Option<&UserId>) -> bool;
}

/// Permits everything; the default when no policy service is wired in
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_apply(&self, _run: &Run, _user: Option<&UserId>) -> bool {
        true
    }
}

/// Denies applies for everyone except the listed users
#[cfg(test)]
pub(crate) struct OnlyUsers(pub Vec<UserId>);

#[cfg(test)]
#[async_trait]
impl Authorizer for OnlyUsers {
    async fn can_apply(&self, _run: &Run, user: Option<&UserId>) -> bool {
        user.is_some_and(|u| self.0.contains(u))
    }
}
