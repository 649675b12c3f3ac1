/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use crate::jpu_error::{err_exit_code, ErrorCode, Result};

/// Where one hardware invocation is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameJobState {
    Idle,

    /// parameters validated, tables resolved
    Configured,

    /// registers programmed and the start bit written
    Started,

    /// the caller is waiting for the interrupt
    AwaitingCompletion,

    Collected,

    Failed(ErrorCode),
}

/// One encode or decode operation, from configuration to collection
#[derive(Debug, Clone)]
pub struct FrameJob {
    state: FrameJobState,
    frame_index: u32,
    register_bank: usize,
}

impl FrameJob {
    pub fn new(frame_index: u32, register_bank: usize) -> Self {
        FrameJob {
            state: FrameJobState::Idle,
            frame_index,
            register_bank,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> FrameJobState {
        self.state
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn register_bank(&self) -> usize {
        self.register_bank
    }

    /// true while the hardware may still be working on the job
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.state,
            FrameJobState::Started | FrameJobState::AwaitingCompletion
        )
    }

    fn advance(&mut self, allowed: &[FrameJobState], to: FrameJobState) -> Result<()> {
        if !allowed.contains(&self.state) {
            return err_exit_code(
                ErrorCode::WrongCallSequence,
                format!(
                    "frame job {0} cannot go from {1:?} to {2:?}",
                    self.frame_index, self.state, to
                ),
            );
        }
        self.state = to;
        Ok(())
    }

    pub fn configure(&mut self) -> Result<()> {
        self.advance(&[FrameJobState::Idle], FrameJobState::Configured)
    }

    pub fn start(&mut self) -> Result<()> {
        self.advance(&[FrameJobState::Configured], FrameJobState::Started)
    }

    /// Waiting again after a timeout that left the job on the hardware is allowed
    pub fn begin_wait(&mut self) -> Result<()> {
        self.advance(
            &[FrameJobState::Started, FrameJobState::AwaitingCompletion],
            FrameJobState::AwaitingCompletion,
        )
    }

    pub fn collect(&mut self) -> Result<()> {
        self.advance(
            &[FrameJobState::AwaitingCompletion],
            FrameJobState::Collected,
        )
    }

    /// Absorbing, reachable from any state
    pub fn fail(&mut self, reason: ErrorCode) {
        if !matches!(self.state, FrameJobState::Failed(_)) {
            self.state = FrameJobState::Failed(reason);
        }
    }
}
