//! SynchronizedGroupController -- lockstep start of several DUCs.
//!
//! The radio can hold a set of DUCs in a group and enable them with a single
//! `DUCGE` command, so they begin consuming on the same sample. The group
//! controller drives that sequence:
//!
//! ```text
//!  Configuring --start()--> Priming --all members ready--> Enabled
//!       ^                      |                              |
//!       |                      +-----------stop()-------------+
//!       |                                                     v
//!       +-------------------(start() again)------------- Stopped
//! ```
//!
//! While priming, the radio is not consuming, so members fill their buffers
//! until the backlog reaches the prime threshold. A member whose gate denies
//! is paused: its block is offered without blocking and may be refused. Once
//! every member has been seen ready since the last `start()`, one group
//! enable is sent.

use std::collections::HashSet;
use std::sync::Arc;

use ductx_core::{Error, IqSample, Result};

use crate::channel::ChannelController;
use crate::codec;
use crate::command::CommandChannel;
use crate::feedback::status_port;
use crate::models::NdrRadioModel;

/// Lifecycle of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Built, never started.
    Configuring,
    /// Members started, group disabled on the radio, buffers filling.
    Priming,
    /// Group enabled; the radio is consuming.
    Enabled,
    /// Group disabled and members stopped.
    Stopped,
}

/// Group settings.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// DUC group index on the radio (1-based).
    pub group: u8,
    /// Backlog each member must reach before the group is enabled; `None`
    /// means half the member's buffer.
    pub prime_threshold: Option<u32>,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            group: 1,
            prime_threshold: None,
        }
    }
}

/// Starts a set of channels together through a radio DUC group.
pub struct SynchronizedGroupController {
    commands: Arc<CommandChannel>,
    members: Vec<ChannelController>,
    model: NdrRadioModel,
    group: u8,
    state: GroupState,
    enable_count: u64,
    span: tracing::Span,
}

impl SynchronizedGroupController {
    /// Take ownership of `members` and validate them as one group.
    ///
    /// Members must be non-empty, on distinct channels, with distinct 20-bit
    /// stream ids that also map to distinct status ports. The prime threshold must be positive and leave room for one more
    /// block in every member's buffer.
    pub fn new(
        commands: Arc<CommandChannel>,
        members: Vec<ChannelController>,
        options: GroupOptions,
    ) -> Result<Self> {
        let first = members
            .first()
            .ok_or_else(|| Error::Configuration("group needs at least one member".into()))?;
        let model = first.model().clone();
        model.check_group(options.group)?;

        let mut channels = HashSet::new();
        let mut stream_ids = HashSet::new();
        let mut status_ports = HashSet::new();
        for m in &members {
            if !channels.insert(m.channel()) {
                return Err(Error::Configuration(format!(
                    "DUC {} appears twice in group {}",
                    m.channel(),
                    options.group
                )));
            }
            let wire_id = m.config().stream_id_20();
            if !stream_ids.insert(wire_id) {
                return Err(Error::Configuration(format!(
                    "stream id {} ({:#07x} on the wire) used by more than one member of group {}",
                    m.stream_id(),
                    wire_id,
                    options.group
                )));
            }
            let port = status_port(wire_id);
            if !status_ports.insert(port) {
                return Err(Error::Configuration(format!(
                    "stream id {} shares status port {} with another member of group {}",
                    m.stream_id(),
                    port,
                    options.group
                )));
            }
        }

        for m in &members {
            let capacity = m.tracker().capacity();
            let block = m.samples_per_frame() as u32;
            let threshold = options.prime_threshold.unwrap_or(capacity / 2);
            let limit = capacity.saturating_sub(block);
            if threshold == 0 || threshold > limit {
                return Err(Error::Configuration(format!(
                    "prime threshold {} for DUC {} must be in 1..={} (buffer {}, block {})",
                    threshold,
                    m.channel(),
                    limit,
                    capacity,
                    block
                )));
            }
            m.tracker().set_prime_threshold(threshold);
        }

        let span = tracing::info_span!("duc_group", group = options.group);
        tracing::debug!(parent: &span, members = members.len(), "Group built");

        Ok(Self {
            commands,
            members,
            model,
            group: options.group,
            state: GroupState::Configuring,
            enable_count: 0,
            span,
        })
    }

    /// Set up radio-side membership with the group disabled, start every
    /// member and enter [`GroupState::Priming`].
    ///
    /// Legal from `Configuring` or `Stopped`. Members already running on
    /// their own are stopped first, so every member starts disabled with
    /// fresh readiness. If a member fails to start, the members already
    /// started are stopped again.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            GroupState::Configuring | GroupState::Stopped => {}
            other => {
                return Err(Error::InvalidParameter(format!(
                    "cannot start group {} while {:?}",
                    self.group, other
                )));
            }
        }

        for m in self.members.iter().filter(|m| m.is_running()) {
            tracing::debug!(parent: &self.span, channel = m.channel(), "Stopping member before group start");
            m.stop()?;
        }

        for ch in 1..=self.model.duc_count {
            self.commands
                .execute(&codec::cmd_group_member(self.group, ch, false))?;
        }
        for m in &self.members {
            self.commands
                .execute(&codec::cmd_group_member(self.group, m.channel(), true))?;
        }
        self.commands
            .execute(&codec::cmd_group_enable(self.group, false))?;

        for (i, m) in self.members.iter().enumerate() {
            if let Err(e) = m.start() {
                tracing::error!(parent: &self.span, channel = m.channel(), error = %e, "Member failed to start");
                for started in &self.members[..i] {
                    let _ = started.stop();
                }
                return Err(e);
            }
        }

        self.state = GroupState::Priming;
        tracing::info!(parent: &self.span, members = self.members.len(), "Group priming");
        Ok(())
    }

    /// Forward one block to each member, in member order.
    ///
    /// Returns the samples each member accepted. While priming, a paused
    /// member may report 0: its block was not sent and should be offered
    /// again.
    ///
    /// An error from one member ends the call there: members before it have
    /// buffered their block, members after it have not. The streams are then
    /// out of step and the group must be stopped and started again.
    pub fn send_frames(&mut self, blocks: &[&[IqSample]]) -> Result<Vec<usize>> {
        if blocks.len() != self.members.len() {
            return Err(Error::Configuration(format!(
                "{} blocks for {} members",
                blocks.len(),
                self.members.len()
            )));
        }
        if !matches!(self.state, GroupState::Priming | GroupState::Enabled) {
            return Err(Error::StreamClosed);
        }

        let mut paused = vec![false; self.members.len()];
        if self.state == GroupState::Priming {
            for (p, (m, b)) in paused.iter_mut().zip(self.members.iter().zip(blocks)) {
                *p = !m.tracker().ok_to_send(b.len() as u32);
            }
            if paused.iter().any(|&p| p) {
                self.check_ready()?;
            }
        }

        let priming = self.state == GroupState::Priming;
        let mut sent = Vec::with_capacity(blocks.len());
        for ((m, b), p) in self.members.iter().zip(blocks).zip(&paused) {
            let n = if priming && *p {
                m.try_send_samples(b)?
            } else {
                m.send_samples(b)?
            };
            sent.push(n);
        }

        if self.state == GroupState::Priming {
            self.check_ready()?;
        }
        Ok(sent)
    }

    /// Enable the group if every member is ready. Returns whether the group
    /// is enabled.
    ///
    /// Readiness is read once per member into a snapshot, and the enable is
    /// sent at most once per `start()`.
    pub fn check_ready(&mut self) -> Result<bool> {
        if self.state != GroupState::Priming {
            return Ok(self.state == GroupState::Enabled);
        }
        let ready: Vec<bool> = self.members.iter().map(|m| m.is_ready()).collect();
        if !ready.iter().all(|&r| r) {
            tracing::trace!(parent: &self.span, ?ready, "Group still priming");
            return Ok(false);
        }

        self.commands
            .execute(&codec::cmd_group_enable(self.group, true))?;
        self.state = GroupState::Enabled;
        self.enable_count += 1;
        tracing::info!(parent: &self.span, "Group enabled");
        Ok(true)
    }

    /// Disable the group, then stop every member.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned.
    pub fn stop(&mut self) -> Result<()> {
        if !matches!(self.state, GroupState::Priming | GroupState::Enabled) {
            return Ok(());
        }

        let mut first_err = None;
        if let Err(e) = self
            .commands
            .execute(&codec::cmd_group_enable(self.group, false))
        {
            tracing::warn!(parent: &self.span, error = %e, "Failed to disable group");
            first_err.get_or_insert(e);
        }
        for m in &self.members {
            if let Err(e) = m.stop() {
                first_err.get_or_insert(e);
            }
        }

        self.state = GroupState::Stopped;
        tracing::info!(parent: &self.span, "Group stopped");
        first_err.map_or(Ok(()), Err)
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn members(&self) -> &[ChannelController] {
        &self.members
    }

    /// Group enables sent since construction.
    pub fn enable_count(&self) -> u64 {
        self.enable_count
    }
}

impl Drop for SynchronizedGroupController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(parent: &self.span, error = %e, "Group stop on drop failed");
        }
    }
}

impl std::fmt::Debug for SynchronizedGroupController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizedGroupController")
            .field("group", &self.group)
            .field("state", &self.state)
            .field("members", &self.members.len())
            .field("enable_count", &self.enable_count)
            .finish_non_exhaustive()
    }
}
