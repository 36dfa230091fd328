//! Call-site resolution for observed queries
//!
//! When a statement executes, the innermost frames on the stack belong to
//! this crate, the stack walker, the driver and the runtime. The frame we
//! want to blame is the first one outside all of those: the application
//! code that issued the query.
//!
//! # Algorithm
//!
//! 1. Capture a window of frames (initially 8), dropping `skip_frames`
//!    innermost ones
//! 2. Return the first frame whose qualified name matches no internal prefix
//!    and that carries file/line information
//! 3. If the window was full and nothing matched, move past it, double the
//!    window and try again (bounded number of passes)
//! 4. A short window means the stack is exhausted: give up with `None`
//!
//! Stack introspection sits behind [`FrameSource`] so the walk can be tested
//! against synthetic stacks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Size of the first capture window
const INITIAL_WINDOW: usize = 8;

/// Widening passes before giving up (8 + 16 + ... + 256 frames)
const MAX_PASSES: usize = 6;

/// Resolved instruction pointers kept before the cache is flushed
const SYMBOL_CACHE_LIMIT: usize = 4096;

/// Source location blamed for a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    pub file: String,
    pub line: u32,
}

impl CallSite {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// One logical stack frame (inlined functions are separate frames)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Demangled qualified name without the trailing hash
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Frame {
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            function: Some(function.into()),
            file: Some(file.into()),
            line: Some(line),
        }
    }

    /// A frame the symbolizer could not resolve
    pub fn unresolved() -> Self {
        Self {
            function: None,
            file: None,
            line: None,
        }
    }

    fn call_site(&self) -> Option<CallSite> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(CallSite::new(file.clone(), line)),
            _ => None,
        }
    }
}

/// Stack introspection capability
pub trait FrameSource: Send + Sync {
    /// Up to `limit` frames of the caller's stack, innermost first, after
    /// dropping the `skip` innermost ones. Fewer than `limit` frames means
    /// the stack ended.
    fn frames(&self, skip: usize, limit: usize) -> Vec<Frame>;
}

/// Live stack of the calling thread, via the `backtrace` crate
///
/// Symbolication is the expensive part, and N+1 patterns hit the same
/// return addresses over and over, so resolved frames are cached per
/// instruction pointer.
#[derive(Debug, Default)]
pub struct BacktraceSource {
    symbols: Mutex<HashMap<usize, Arc<[Frame]>>>,
}

impl BacktraceSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn symbolize(&self, frame: &backtrace::Frame) -> Arc<[Frame]> {
        let ip = frame.ip() as usize;
        if let Ok(cache) = self.symbols.lock() {
            if let Some(hit) = cache.get(&ip) {
                return hit.clone();
            }
        }

        let mut resolved = Vec::with_capacity(1);
        backtrace::resolve_frame(frame, |symbol| {
            resolved.push(Frame {
                function: symbol.name().map(|name| format!("{:#}", name)),
                file: symbol.filename().map(|path| path.display().to_string()),
                line: symbol.lineno(),
            });
        });
        if resolved.is_empty() {
            resolved.push(Frame::unresolved());
        }
        let resolved: Arc<[Frame]> = resolved.into();

        if let Ok(mut cache) = self.symbols.lock() {
            if cache.len() >= SYMBOL_CACHE_LIMIT {
                cache.clear();
            }
            cache.insert(ip, resolved.clone());
        }
        resolved
    }
}

impl FrameSource for BacktraceSource {
    fn frames(&self, skip: usize, limit: usize) -> Vec<Frame> {
        let mut out = Vec::with_capacity(limit);
        let mut index = 0usize;

        backtrace::trace(|raw| {
            for frame in self.symbolize(raw).iter() {
                if out.len() >= limit {
                    return false;
                }
                if index >= skip {
                    out.push(frame.clone());
                }
                index += 1;
            }
            out.len() < limit
        });

        out
    }
}

/// Fixed stack, innermost first
#[derive(Debug, Clone, Default)]
pub struct FixedFrames(pub Vec<Frame>);

impl FrameSource for FixedFrames {
    fn frames(&self, skip: usize, limit: usize) -> Vec<Frame> {
        self.0.iter().skip(skip).take(limit).cloned().collect()
    }
}

/// Finds the application frame responsible for the current query
#[derive(Clone)]
pub struct CallerResolver {
    source: Arc<dyn FrameSource>,
    prefixes: Vec<String>,
    skip_frames: usize,
}

impl fmt::Debug for CallerResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerResolver")
            .field("prefixes", &self.prefixes)
            .field("skip_frames", &self.skip_frames)
            .finish_non_exhaustive()
    }
}

impl CallerResolver {
    /// Resolver over the live stack
    pub fn new(prefixes: Vec<String>, skip_frames: usize) -> Self {
        Self::with_source(Arc::new(BacktraceSource::new()), prefixes, skip_frames)
    }

    pub fn with_source(
        source: Arc<dyn FrameSource>,
        prefixes: Vec<String>,
        skip_frames: usize,
    ) -> Self {
        Self {
            source,
            prefixes,
            skip_frames,
        }
    }

    /// Whether a qualified name belongs to internal code
    ///
    /// Trait impl frames render as `<crate::Type as Trait>::method`, so a
    /// leading `<` is ignored.
    pub fn is_internal(&self, function: &str) -> bool {
        let name = function.trim_start_matches('<');
        self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// First non-internal frame with a known location, if any
    pub fn resolve(&self) -> Option<CallSite> {
        let mut skip = self.skip_frames;
        let mut window = INITIAL_WINDOW;

        for _ in 0..MAX_PASSES {
            let frames = self.source.frames(skip, window);

            if let Some(site) = frames.iter().find_map(|frame| self.candidate(frame)) {
                return Some(site);
            }

            if frames.len() < window {
                return None; // stack exhausted
            }
            skip += frames.len();
            window *= 2;
        }

        None
    }

    fn candidate(&self, frame: &Frame) -> Option<CallSite> {
        // Unnamed frames cannot be attributed to anyone
        let function = frame.function.as_deref()?;
        if self.is_internal(function) {
            return None;
        }
        frame.call_site()
    }
}
