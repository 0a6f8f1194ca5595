//! # Memory-related Kernel Command Line Options
//!
//! Zero-copy parsing of the boot arguments the early memory code cares about:
//!
//! | Option | Effect |
//! |--------|--------|
//! | `mem=<size>` | Cap usable memory to `<size>` bytes (page aligned). |
//! | `crashkernel=<spec>` | Reserve memory for a capture kernel. |
//! | `movable_node` | Keep hot-pluggable memory away from boot allocations. |
//! | `kernelcore=mirror` | Prefer mirrored memory for boot allocations. |
//! | `memblock=debug` | Dump all region sets at the end of early boot. |
//!
//! Sizes accept a `0x`/`0` radix prefix and a `K`/`M`/`G`/`T`/`P`/`E` suffix.
//!
//! `crashkernel=` comes in two forms:
//! - `size[@offset]`
//! - `start-[end]:size[,start-[end]:size...][@offset]`, where the first range
//!   containing the amount of system RAM selects the size.

use crate::memory::PAGE_SIZE;
use kernel_memory_addresses::align_down;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CmdlineError {
    #[error("expected a number at {0:?}")]
    InvalidNumber(usize),
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    #[error("expected {0:?}")]
    Expected(char),
    #[error("range end {end:#x} must lie above its start {start:#x}")]
    InvalidRange { start: u64, end: u64 },
}

/// Size and optional base requested via `crashkernel=`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CrashKernelRequest {
    pub size: u64,
    /// `None` lets the allocator pick the location.
    pub base: Option<u64>,
}

/// Parsed memory options. Borrowed from the command line; `crashkernel=` is
/// resolved later because the range form depends on the amount of RAM.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BootConfig<'a> {
    pub memory_limit: Option<u64>,
    pub crashkernel: Option<&'a str>,
    pub movable_node: bool,
    pub mirrored_kernelmem: bool,
    pub memblock_debug: bool,
}

impl<'a> BootConfig<'a> {
    /// Pick the memory options out of a full command line. Unrelated options
    /// are ignored; a malformed `mem=` is an error.
    ///
    /// # Errors
    /// Returns [`CmdlineError`] if `mem=` does not hold a size.
    pub fn parse(cmdline: &'a str) -> Result<Self, CmdlineError> {
        let mut config = Self::default();
        for token in cmdline.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };
            match (key, value) {
                ("mem", Some(value)) => {
                    let (limit, _) = memparse(value)?;
                    config.memory_limit = Some(align_down(limit, PAGE_SIZE));
                }
                ("crashkernel", Some(value)) => config.crashkernel = Some(value),
                ("movable_node", None) => config.movable_node = true,
                ("kernelcore", Some("mirror")) => config.mirrored_kernelmem = true,
                ("memblock", Some("debug")) => config.memblock_debug = true,
                _ => {}
            }
        }
        Ok(config)
    }

    /// Resolve `crashkernel=` against the amount of system RAM.
    ///
    /// Returns `Ok(None)` when the option is absent or selects a zero size.
    ///
    /// # Errors
    /// Returns [`CmdlineError`] if the option is malformed.
    pub fn crash_kernel_request(
        &self,
        system_ram: u64,
    ) -> Result<Option<CrashKernelRequest>, CmdlineError> {
        match self.crashkernel {
            Some(spec) => parse_crashkernel(spec, system_ram),
            None => Ok(None),
        }
    }
}

/// Parse a size with optional radix prefix and binary suffix.
/// Returns the value and the unparsed remainder.
///
/// # Errors
/// Returns [`CmdlineError::InvalidNumber`] if `s` does not start with a
/// digit or the value does not fit 64 bits.
pub fn memparse(s: &str) -> Result<(u64, &str), CmdlineError> {
    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, hex)
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    if end == 0 && radix != 8 {
        return Err(CmdlineError::InvalidNumber(0));
    }

    let mut value: u64 = 0;
    for c in digits[..end].chars() {
        let digit = u64::from(c.to_digit(radix).unwrap_or_default());
        value = value
            .checked_mul(u64::from(radix))
            .and_then(|v| v.checked_add(digit))
            .ok_or(CmdlineError::InvalidNumber(0))?;
    }

    let mut rest = &digits[end..];
    let shift = match rest.chars().next() {
        Some('E' | 'e') => 60,
        Some('P' | 'p') => 50,
        Some('T' | 't') => 40,
        Some('G' | 'g') => 30,
        Some('M' | 'm') => 20,
        Some('K' | 'k') => 10,
        _ => 0,
    };
    if shift != 0 {
        rest = &rest[1..];
        value = value
            .checked_mul(1 << shift)
            .ok_or(CmdlineError::InvalidNumber(0))?;
    }
    Ok((value, rest))
}

fn parse_crashkernel(spec: &str, system_ram: u64) -> Result<Option<CrashKernelRequest>, CmdlineError> {
    let first_colon = spec.find(':');
    let first_at = spec.find('@');
    let request = match (first_colon, first_at) {
        (Some(colon), Some(at)) if colon < at => parse_crashkernel_mem(spec, system_ram)?,
        (Some(_), None) => parse_crashkernel_mem(spec, system_ram)?,
        _ => parse_crashkernel_simple(spec)?,
    };
    Ok(request.filter(|r| r.size != 0))
}

fn parse_crashkernel_simple(spec: &str) -> Result<Option<CrashKernelRequest>, CmdlineError> {
    let (size, rest) = memparse(spec)?;
    let base = match rest.chars().next() {
        Some('@') => Some(memparse(&rest[1..])?.0),
        Some(c) => return Err(CmdlineError::UnexpectedChar(c)),
        None => None,
    };
    Ok(Some(CrashKernelRequest { size, base }))
}

fn parse_crashkernel_mem(spec: &str, system_ram: u64) -> Result<Option<CrashKernelRequest>, CmdlineError> {
    let mut cur = spec;
    let mut selected = None;

    loop {
        let (start, rest) = memparse(cur)?;
        let rest = rest.strip_prefix('-').ok_or(CmdlineError::Expected('-'))?;

        let (end, rest) = if rest.starts_with(':') {
            (u64::MAX, rest)
        } else {
            let (end, rest) = memparse(rest)?;
            if end <= start {
                return Err(CmdlineError::InvalidRange { start, end });
            }
            (end, rest)
        };

        let rest = rest.strip_prefix(':').ok_or(CmdlineError::Expected(':'))?;
        let (size, rest) = memparse(rest)?;

        if selected.is_none() && system_ram >= start && system_ram < end {
            selected = Some(size);
        }

        match rest.strip_prefix(',') {
            Some(next) => cur = next,
            None => {
                cur = rest;
                break;
            }
        }
    }

    let base = match cur.chars().next() {
        Some('@') => Some(memparse(&cur[1..])?.0),
        Some(c) => return Err(CmdlineError::UnexpectedChar(c)),
        None => None,
    };

    Ok(selected.map(|size| CrashKernelRequest { size, base }))
}
