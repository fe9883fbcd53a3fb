use nostr_sdk::prelude::PublicKey;

use crate::model::DmMessage;
use crate::store::ConversationStore;

pub const MESSAGES_PER_PAGE: usize = 25;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationPage {
    /// Most recent messages, oldest first.
    pub messages: Vec<DmMessage>,
    pub has_more_messages: bool,
    pub total_count: usize,
    pub last_message: Option<DmMessage>,
    pub last_activity: u64,
}

/// Read-only window over one conversation that grows a page at a time.
#[derive(Debug, Clone)]
pub struct ConversationView {
    partner: Option<PublicKey>,
    page_size: usize,
    visible: usize,
}

impl Default for ConversationView {
    fn default() -> Self {
        Self::new(MESSAGES_PER_PAGE)
    }
}

impl ConversationView {
    pub fn new(page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            partner: None,
            page_size,
            visible: page_size,
        }
    }

    pub fn partner(&self) -> Option<PublicKey> {
        self.partner
    }

    /// Switching partner resets the window to one page.
    pub fn select(&mut self, partner: Option<PublicKey>) {
        if self.partner != partner {
            self.partner = partner;
            self.visible = self.page_size;
        }
    }

    pub fn load_earlier(&mut self) {
        self.visible += self.page_size;
    }

    pub fn page(&self, store: &ConversationStore) -> ConversationPage {
        let Some(partner) = self.partner else {
            return ConversationPage::default();
        };
        let Some(conversation) = store.get(&partner) else {
            return ConversationPage::default();
        };
        let total_count = conversation.messages.len();
        let start = total_count.saturating_sub(self.visible);
        ConversationPage {
            messages: conversation.messages[start..].to_vec(),
            has_more_messages: start > 0,
            total_count,
            last_message: conversation.last_message().cloned(),
            last_activity: conversation.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::tests::text_message;
    use nostr_sdk::prelude::Keys;

    fn store_with(partner: PublicKey, count: u64) -> ConversationStore {
        let store = ConversationStore::new();
        let messages = (0..count)
            .map(|i| text_message(&format!("m{i}"), partner, i, "x"))
            .collect();
        store.merge_batch(HashMap::from([(partner, messages)]));
        store
    }

    #[test]
    fn shows_most_recent_page_and_grows() {
        let bob = Keys::generate().public_key();
        let store = store_with(bob, 60);
        let mut view = ConversationView::default();
        view.select(Some(bob));

        let page = view.page(&store);
        assert_eq!(page.messages.len(), 25);
        assert_eq!(page.messages[0].id, "m35");
        assert!(page.has_more_messages);
        assert_eq!(page.total_count, 60);

        view.load_earlier();
        view.load_earlier();
        let page = view.page(&store);
        assert_eq!(page.messages.len(), 60);
        assert!(!page.has_more_messages);
        assert_eq!(page.last_activity, 59);
    }

    #[test]
    fn switching_partner_resets_window() {
        let bob = Keys::generate().public_key();
        let carol = Keys::generate().public_key();
        let store = store_with(bob, 60);
        let mut view = ConversationView::new(10);
        view.select(Some(bob));
        view.load_earlier();
        assert_eq!(view.page(&store).messages.len(), 20);

        view.select(Some(carol));
        view.select(Some(bob));
        assert_eq!(view.page(&store).messages.len(), 10);
    }

    #[test]
    fn unknown_partner_yields_empty_page() {
        let store = ConversationStore::new();
        let mut view = ConversationView::default();
        assert_eq!(view.page(&store), ConversationPage::default());
        view.select(Some(Keys::generate().public_key()));
        assert!(view.page(&store).messages.is_empty());
    }
}
