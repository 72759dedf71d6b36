/// Engine events for external subscribers.
///
/// The engine never talks to a notification center directly; it emits plain
/// events and the application decides what to render or schedule.

use tokio::sync::broadcast;

use crate::groups::ids::{Aci, GroupIdentifier, Pni};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupEvent {
    /// The persisted model advanced to this revision. `user_facing` is true
    /// when the transition changed something a user can see, which should
    /// drive notification-message insertion and a UI-list touch.
    UpdatedToRevision {
        group_id: GroupIdentifier,
        revision: u32,
        user_facing: bool,
    },

    /// Local state was corrected to reflect that we are out of the group.
    RemovedLocally { group_id: GroupIdentifier },

    /// We were added by a blocked user; the application should leave the
    /// group once message processing quiesces.
    ScheduledAutoLeave { group_id: GroupIdentifier },

    /// The group carries a stale profile key for the local user; a key
    /// update push should be scheduled.
    ScheduledProfileKeyRotation { group_id: GroupIdentifier },

    /// A secondary identity was promoted to its primary identity. From the
    /// symmetric-difference heuristic or an explicit promotion action.
    MemberPromoted {
        group_id: GroupIdentifier,
        pni: Pni,
        aci: Aci,
    },
}

/// Broadcast hub for engine events. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct GroupEvents {
    sender: broadcast::Sender<GroupEvent>,
}

impl GroupEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        GroupEvents { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: GroupEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for GroupEvents {
    fn default() -> Self {
        GroupEvents::new()
    }
}
