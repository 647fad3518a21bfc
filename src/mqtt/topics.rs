//! Topic names subscribed for a credential.
//!
//! Every credential gets exactly three topics:
//!
//! ```text
//! <namespace>/out/bacnet/create/<credential>
//! <namespace>/out/bacnet/update/<credential>
//! <namespace>/out/bacnet/delete/<credential>
//! ```
//!
//! The namespace is `events-dev` when connecting to the staging broker and
//! `events` otherwise.

use std::fmt;

/// Broker address that selects the staging topic namespace.
pub const DEV_ENDPOINT: &str = "wss://mqtt-test.daizy.io";

const NAMESPACE: &str = "events";
const DEV_NAMESPACE: &str = "events-dev";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicKind {
    Create,
    Update,
    Delete,
}

impl TopicKind {
    pub const ALL: [TopicKind; 3] = [TopicKind::Create, TopicKind::Update, TopicKind::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Create => "create",
            TopicKind::Update => "update",
            TopicKind::Delete => "delete",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The create/update/delete topics for one credential on one endpoint.
///
/// Topic strings embed the credential, so they are never logged; log the
/// [`TopicKind`] instead.
#[derive(Clone, PartialEq, Eq)]
pub struct TopicSet {
    create: String,
    update: String,
    delete: String,
}

impl TopicSet {
    pub fn derive(credential: &str, endpoint: &str) -> Self {
        let namespace = Self::namespace_for(endpoint);
        let topic = |kind: TopicKind| format!("{namespace}/out/bacnet/{kind}/{credential}");

        Self {
            create: topic(TopicKind::Create),
            update: topic(TopicKind::Update),
            delete: topic(TopicKind::Delete),
        }
    }

    pub fn namespace_for(endpoint: &str) -> &'static str {
        if endpoint == DEV_ENDPOINT {
            DEV_NAMESPACE
        } else {
            NAMESPACE
        }
    }

    pub fn topic(&self, kind: TopicKind) -> &str {
        match kind {
            TopicKind::Create => &self.create,
            TopicKind::Update => &self.update,
            TopicKind::Delete => &self.delete,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TopicKind, &str)> {
        TopicKind::ALL.into_iter().map(move |kind| (kind, self.topic(kind)))
    }

    /// Which of the three topics an inbound message arrived on, if any.
    pub fn kind_of(&self, topic: &str) -> Option<TopicKind> {
        self.iter()
            .find(|(_, candidate)| *candidate == topic)
            .map(|(kind, _)| kind)
    }
}

impl fmt::Debug for TopicSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TopicSet").finish_non_exhaustive()
    }
}
