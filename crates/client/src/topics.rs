//! Registry of backend collections the client subscribes to.

use backdesk_shared::ClientFrame;

/// A subscribable backend collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Collection name as the backend knows it.
    pub collection: String,
    /// Singular, human-readable label used in notification titles.
    pub label: String,
}

impl Topic {
    pub fn new(collection: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            label: label.into(),
        }
    }

    /// The subscribe frame for this topic.
    pub fn subscribe_frame(&self) -> ClientFrame {
        ClientFrame::subscribe(self.collection.clone())
    }
}

const BUILTIN_TOPICS: &[(&str, &str)] = &[
    ("orders", "Order"),
    ("order_items", "Order item"),
    ("products", "Product"),
    ("categories", "Category"),
    ("customers", "Customer"),
    ("inventory", "Inventory item"),
    ("payments", "Payment"),
    ("shipments", "Shipment"),
    ("reviews", "Review"),
];

/// Collections polled when the realtime channel is down. Each poll is a full
/// request, so this is deliberately smaller than the realtime set.
pub const DEFAULT_POLLED_TOPICS: &[&str] = &["orders", "products", "customers", "inventory"];

/// The fixed set of topics subscribed on every `Ready` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRegistry {
    topics: Vec<Topic>,
}

impl TopicRegistry {
    pub fn new(topics: Vec<Topic>) -> Self {
        Self { topics }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn get(&self, collection: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.collection == collection)
    }

    /// Label for a collection, falling back to the collection name itself.
    pub fn label_for<'a>(&'a self, collection: &'a str) -> &'a str {
        self.get(collection)
            .map(|t| t.label.as_str())
            .unwrap_or(collection)
    }

    /// One subscribe frame per topic, in registry order.
    pub fn subscribe_frames(&self) -> Vec<ClientFrame> {
        self.topics.iter().map(Topic::subscribe_frame).collect()
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(
            BUILTIN_TOPICS
                .iter()
                .map(|(collection, label)| Topic::new(*collection, *label))
                .collect(),
        )
    }
}
