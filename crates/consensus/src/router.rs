//! Message router: the single admission entry point

use crate::message::Message;
use crate::state::NodeState;
use crate::types::Validity;

impl NodeState {
    /// Validate a message and hand it to leader or follower execution
    pub fn try_to_process(&mut self, msg: Message) {
        let validity = msg.validate(self);
        if validity != Validity::Accept {
            tracing::debug!("{}: {} is {:?}, dropping", self.config.node_name, msg, validity);
            self.stats.messages_invalid += 1;
            self.queues.invalid.push(msg);
            return;
        }

        let lane = self.lane_of(&msg);
        let leads = self.leader && msg.leader_path() && (lane == self.leader_vm_index || msg.is_local());
        if !leads || self.already_ordered(&msg) {
            self.exe_follow(msg);
            return;
        }

        // Mid-minute a leader only orders onto a lane without gaps
        if self.eom == 0 && !self.good_to(lane) {
            tracing::trace!("{}: lane {} not caught up, stalling {}", self.config.node_name, lane, msg);
            self.stall_msg(msg);
            return;
        }
        self.exe_leader(msg);
    }

    /// Acked or held messages only need their pair matched; acking them
    /// again would leave a gap in the lane.
    fn already_ordered(&self, msg: &Message) -> bool {
        let hash = msg.hash();
        self.acks.contains_key(&hash) || self.holding.contains_key(&hash)
    }

    /// A message that came back through the stall queue was broadcast the
    /// first time round; it goes out again only once admitted.
    fn should_broadcast(&self, msg: &Message) -> bool {
        !msg.stalled || self.process_lists.has_old_msg(&msg.hash())
    }

    fn good_to(&self, lane: usize) -> bool {
        self.process_lists
            .get(self.leader_height)
            .map_or(true, |pl| pl.good_to(lane))
    }

    fn exe_leader(&mut self, msg: Message) {
        let local_eom = msg.is_local() && msg.is_eom();
        match msg.clone().leader_execute(self) {
            Ok(executed) => self.queues.network_out.push(executed),
            // Re-stalling our own EOM could close a minute twice
            Err(e) if local_eom => {
                tracing::debug!("{}: local EOM dropped: {}", self.config.node_name, e);
            }
            Err(e) if e.is_recoverable() => self.stall_msg(msg),
            Err(e) => {
                tracing::warn!("{}: leader execution of {} failed: {}", self.config.node_name, msg, e);
                self.stats.messages_invalid += 1;
                self.queues.invalid.push(msg);
            }
        }
    }

    fn exe_follow(&mut self, msg: Message) {
        // Local EOMs only come from the leader of a lane
        if !self.leader && msg.is_local() && msg.is_eom() {
            return;
        }
        match msg.clone().follower_execute(self) {
            Ok(()) => {
                if self.should_broadcast(&msg) {
                    self.queues.network_out.push(msg);
                }
            }
            Err(e) if e.is_recoverable() => self.stall_msg(msg),
            Err(e) => {
                tracing::warn!("{}: follower execution of {} failed: {}", self.config.node_name, msg, e);
                self.stats.messages_invalid += 1;
                self.queues.invalid.push(msg);
            }
        }
    }

    /// Take one message off the queues and process it.
    ///
    /// The leader queue always goes first. When both the stall and follower
    /// queues have work they take turns. Returns whether a leader or
    /// follower message was taken; re-offering a stalled message is not
    /// progress.
    pub fn process_queues(&mut self) -> bool {
        let mut progress = false;

        let msg = match self.queues.leader.try_pop() {
            Some(msg) => {
                progress = true;
                Some(msg)
            }
            None => self.next_stalled_or_follower(&mut progress),
        };
        let Some(msg) = msg else {
            return progress;
        };

        let seen = self
            .process_lists
            .get(self.leader_height)
            .is_some_and(|pl| pl.has_old_msg(&msg.hash()));
        if seen {
            tracing::trace!("{}: {} already admitted", self.config.node_name, msg);
            return progress;
        }

        self.try_to_process(msg);
        progress
    }

    fn next_stalled_or_follower(&mut self, progress: &mut bool) -> Option<Message> {
        let stall_ready = !self.queues.stall.is_empty();
        let follower_ready = !self.queues.follower.is_empty();
        let take_stalled = stall_ready && (!follower_ready || self.prefer_stalled);
        if stall_ready && follower_ready {
            self.prefer_stalled = !self.prefer_stalled;
        }

        if take_stalled {
            let mut msg = self.queues.stall.try_pop()?;
            msg.stalled = true;
            Some(msg)
        } else {
            let msg = self.queues.follower.try_pop()?;
            *progress = true;
            Some(msg)
        }
    }
}
