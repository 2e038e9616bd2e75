//! Saved CPU state and context-switch records

use super::Pid;

/// Registers saved in a task descriptor across a switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub eip: u32,
    pub esp: u32,
    /// Syscall return value; 0 in a freshly forked child
    pub eax: u32,
    pub eflags: u32,
}

impl CpuContext {
    /// Interrupts enabled, reserved bit 1 set
    pub const USER_EFLAGS: u32 = 0x202;

    pub const fn user(eip: u32, esp: u32) -> Self {
        CpuContext {
            eip,
            esp,
            eax: 0,
            eflags: Self::USER_EFLAGS,
        }
    }
}

/// Result of a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub from: Pid,
    pub to: Pid,
}

impl Switch {
    /// Whether the current task actually changed.
    pub fn switched(&self) -> bool {
        self.from != self.to
    }
}
