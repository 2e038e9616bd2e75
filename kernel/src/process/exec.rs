//! Loading a program image into a task and moving its break.

use crate::config::{IDLE_SLOT, PAGE_SIZE, TASK_SIZE};
use crate::kernel::{Kernel, KernelError};
use crate::memory::address_space::{vpn_of, MemoryLayout, Vpn};
use crate::memory::FaultError;
use crate::process::exit::WaitOptions;
use crate::task::{CpuContext, Pid};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// A flat executable: code at address 0, data on the next page boundary,
/// then `bss` zeroed bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramImage {
    pub name: String,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub bss: u32,
}

impl ProgramImage {
    pub fn new(name: &str, code: &[u8], data: &[u8], bss: u32) -> Self {
        ProgramImage {
            name: String::from(name),
            code: code.to_vec(),
            data: data.to_vec(),
            bss,
        }
    }

    /// Layout of this image under a stack limit, or `None` if it does not
    /// fit below the stack.
    pub fn layout(&self, stack_limit: u32) -> Option<MemoryLayout> {
        let end_code = u32::try_from(self.code.len()).ok()?;
        let start_data = align_up(end_code)?;
        let end_data = start_data.checked_add(u32::try_from(self.data.len()).ok()?)?;
        let brk = end_data.checked_add(self.bss)?;
        let stack_floor = TASK_SIZE.checked_sub(stack_limit)?;
        if brk > stack_floor {
            return None;
        }
        Some(MemoryLayout {
            end_code,
            start_data,
            end_data,
            brk,
            stack_floor,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    NoSuchTask(Pid),
    /// The root task keeps its empty image
    RootTask,
    /// Image runs into the stack area
    TooBig,
    Fault(FaultError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::NoSuchTask(pid) => write!(f, "no task with pid {}", pid),
            ExecError::RootTask => write!(f, "cannot load an image into the root task"),
            ExecError::TooBig => write!(f, "image too big"),
            ExecError::Fault(e) => write!(f, "loading image: {}", e),
        }
    }
}

impl From<FaultError> for ExecError {
    fn from(e: FaultError) -> Self {
        ExecError::Fault(e)
    }
}

fn align_up(addr: u32) -> Option<u32> {
    let page = PAGE_SIZE as u32;
    addr.checked_add(page - 1).map(|a| a & !(page - 1))
}

/// First page at or above `addr`; `addr` is below the stack floor.
fn page_ceil(addr: u32) -> Vpn {
    vpn_of(addr + (PAGE_SIZE as u32 - 1))
}

impl Kernel {
    /// Replace the image of `pid`. Code and data pages are written now;
    /// bss and stack fault in as zero pages.
    pub fn exec_image(&mut self, pid: Pid, image: &ProgramImage) -> Result<(), ExecError> {
        let slot = self.live_slot(pid).map_err(|_| ExecError::NoSuchTask(pid))?;
        if slot == IDLE_SLOT {
            return Err(ExecError::RootTask);
        }
        let layout = image.layout(self.config.stack_limit).ok_or(ExecError::TooBig)?;

        let old = match self.tasks.task_mut(slot) {
            Some(task) => {
                let old = task.space.take_all();
                task.space.layout = layout;
                task.name = image.name.clone();
                task.signals.exec_reset();
                task.context = CpuContext::user(0, TASK_SIZE - 4);
                old
            }
            None => return Err(ExecError::NoSuchTask(pid)),
        };
        self.release_pages(old);

        self.write_user(pid, 0, &image.code)?;
        self.write_user(pid, layout.start_data, &image.data)?;
        log::info!(
            "exec {} in task {}: code {:#x}, data {:#x}..{:#x}, brk {:#x}",
            image.name,
            pid,
            layout.end_code,
            layout.start_data,
            layout.end_data,
            layout.brk
        );
        Ok(())
    }

    /// Move the break of `pid` to `addr` and return the break in effect.
    /// A request below the code or into the stack leaves it unchanged.
    pub fn brk(&mut self, pid: Pid, addr: u32) -> Result<u32, ExecError> {
        let slot = self.live_slot(pid).map_err(|_| ExecError::NoSuchTask(pid))?;
        let released = match self.tasks.task_mut(slot) {
            Some(task) => {
                let layout = task.space.layout;
                if addr < layout.end_code || addr >= layout.stack_floor {
                    return Ok(layout.brk);
                }
                task.space.layout.brk = addr;
                if addr < layout.brk {
                    task.space.take_range(page_ceil(addr), page_ceil(layout.brk))
                } else {
                    Vec::new()
                }
            }
            None => return Err(ExecError::NoSuchTask(pid)),
        };
        if !released.is_empty() {
            log::debug!("brk of task {} -> {:#x}, {} pages released", pid, addr, released.len());
        }
        self.release_pages(released);
        Ok(addr)
    }

    /// Fork a fresh task from the root and load `image` into it. If loading
    /// fails the new task is torn down again.
    pub fn spawn(&mut self, image: &ProgramImage) -> Result<Pid, KernelError> {
        let pid = self.fork(Pid::ROOT)?;
        if let Err(e) = self.exec_image(pid, image) {
            log::warn!("spawn of {} failed: {}", image.name, e);
            self.exit(pid, -1)?;
            self.wait(
                Pid::ROOT,
                Some(pid),
                WaitOptions {
                    nohang: true,
                    untraced: false,
                },
            )?;
            return Err(e.into());
        }
        Ok(pid)
    }
}
