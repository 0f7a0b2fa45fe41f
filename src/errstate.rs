//! Floating-point error policy.
//!
//! Each of the four exception categories maps to an [`Action`]. A loop snapshots the
//! thread's [`ErrorConfig`] when it is built and applies it through an [`ErrorPolicy`]
//! after every chunk.

use std::{
    borrow::Cow,
    cell::RefCell,
    fmt,
    io::{self, Write},
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fpe::FpStatus;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Category {
    #[display("divide by zero")]
    DivideByZero,
    #[display("overflow")]
    Overflow,
    #[display("underflow")]
    Underflow,
    #[display("invalid value")]
    Invalid,
}

impl Category {
    /// All categories in checking order.
    pub const ALL: [Category; 4] = [
        Category::DivideByZero,
        Category::Overflow,
        Category::Underflow,
        Category::Invalid,
    ];

    /// Bit offset of this category's slot in a packed [`ErrorMask`].
    #[inline]
    pub const fn shift(self) -> u32 {
        match self {
            Category::DivideByZero => 0,
            Category::Overflow => 3,
            Category::Underflow => 6,
            Category::Invalid => 9,
        }
    }

    #[inline]
    pub const fn status(self) -> FpStatus {
        match self {
            Category::DivideByZero => FpStatus::DIVIDE_BY_ZERO,
            Category::Overflow => FpStatus::OVERFLOW,
            Category::Underflow => FpStatus::UNDERFLOW,
            Category::Invalid => FpStatus::INVALID,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Action {
    #[default]
    Ignore = 0,
    Warn = 1,
    Raise = 2,
    Call = 3,
    Print = 4,
    Log = 5,
}

impl Action {
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Action::Ignore),
            1 => Some(Action::Warn),
            2 => Some(Action::Raise),
            3 => Some(Action::Call),
            4 => Some(Action::Print),
            5 => Some(Action::Log),
            _ => None,
        }
    }
}

/// One action per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ErrorMask {
    pub divide_by_zero: Action,
    pub overflow: Action,
    pub underflow: Action,
    pub invalid: Action,
}

impl Default for ErrorMask {
    fn default() -> Self {
        Self {
            divide_by_zero: Action::Print,
            overflow: Action::Print,
            underflow: Action::Ignore,
            invalid: Action::Print,
        }
    }
}

impl ErrorMask {
    /// The "no checking" mask.
    pub const IGNORE: Self = Self::all(Action::Ignore);

    pub const fn all(action: Action) -> Self {
        Self {
            divide_by_zero: action,
            overflow: action,
            underflow: action,
            invalid: action,
        }
    }

    pub fn get(&self, category: Category) -> Action {
        match category {
            Category::DivideByZero => self.divide_by_zero,
            Category::Overflow => self.overflow,
            Category::Underflow => self.underflow,
            Category::Invalid => self.invalid,
        }
    }

    pub fn set(&mut self, category: Category, action: Action) {
        match category {
            Category::DivideByZero => self.divide_by_zero = action,
            Category::Overflow => self.overflow = action,
            Category::Underflow => self.underflow = action,
            Category::Invalid => self.invalid = action,
        }
    }

    pub fn with(mut self, category: Category, action: Action) -> Self {
        self.set(category, action);
        self
    }

    /// Packs the mask, three bits per slot.
    pub fn bits(&self) -> u32 {
        Category::ALL
            .into_iter()
            .map(|category| (self.get(category) as u32) << category.shift())
            .fold(0, |acc, x| acc | x)
    }

    /// Unpacks a mask produced by [`ErrorMask::bits`]. Fails on an unknown action code.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let mut mask = Self::IGNORE;
        for category in Category::ALL {
            let action = Action::from_bits((bits >> category.shift()) & 0b111)?;
            mask.set(category, action);
        }
        match bits >> 12 {
            0 => Some(mask),
            _ => None,
        }
    }

    #[inline]
    pub fn is_ignore(&self) -> bool {
        *self == Self::IGNORE
    }
}

/// What a policy reports for one tripped category.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{category} encountered in {name}")]
pub struct Diagnostic {
    pub category: Category,
    pub name: String,
    /// Every flag latched during the chunk, not only this category's.
    pub status: FpStatus,
}

/// Receives the `call` action.
pub trait ErrorHandler: Send + Sync {
    fn call(&self, category: Category, status: FpStatus) -> Result<(), BoxError>;
}

impl<F> ErrorHandler for F
where
    F: Fn(Category, FpStatus) -> Result<(), BoxError> + Send + Sync,
{
    fn call(&self, category: Category, status: FpStatus) -> Result<(), BoxError> {
        self(category, status)
    }
}

/// Destination of `warn`, `print` and `log` diagnostics.
pub trait Sink: Send + Sync {
    fn emit(&self, diagnostic: &Diagnostic) -> io::Result<()>;

    fn name(&self) -> Cow<'static, str> {
        std::any::type_name::<Self>().into()
    }
}

/// Writes `Warning: <message>` lines to standard error. The default sink of `warn` and `print`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl Sink for StderrSink {
    fn emit(&self, diagnostic: &Diagnostic) -> io::Result<()> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "Warning: {diagnostic}")
    }
}

/// Records diagnostics through the `log` facade at warn level, with the full latched status.
///
/// The default sink of the `log` action. Falls back to standard error when no logger takes the
/// record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LogSink {
    const TARGET: &'static str = "spindle::fpe";
}

impl Sink for LogSink {
    fn emit(&self, diagnostic: &Diagnostic) -> io::Result<()> {
        if !log::log_enabled!(target: Self::TARGET, log::Level::Warn) {
            let mut stderr = io::stderr().lock();
            return writeln!(stderr, "{diagnostic} (status: {})", diagnostic.status);
        }
        log::warn!(
            target: Self::TARGET,
            "{diagnostic} (status: {})",
            diagnostic.status
        );
        Ok(())
    }
}

/// Keeps every emitted line in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectSink(Arc<Mutex<Vec<String>>>);

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        match self.0.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Sink for CollectSink {
    fn emit(&self, diagnostic: &Diagnostic) -> io::Result<()> {
        let line = format!("Warning: {diagnostic}\n");
        self.0
            .lock()
            .map_err(|_| io::Error::other("collect sink poisoned"))?
            .push(line);
        Ok(())
    }
}

/// The settable error-policy surface: action mask, `call` handler and sinks.
#[derive(Clone)]
pub struct ErrorConfig {
    pub mask: ErrorMask,
    pub handler: Option<Arc<dyn ErrorHandler>>,
    pub warn: Arc<dyn Sink>,
    pub print: Arc<dyn Sink>,
    pub log: Arc<dyn Sink>,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            mask: ErrorMask::default(),
            handler: None,
            warn: Arc::new(StderrSink),
            print: Arc::new(StderrSink),
            log: Arc::new(LogSink),
        }
    }
}

impl fmt::Debug for ErrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorConfig")
            .field("mask", &self.mask)
            .field("handler", &self.handler.is_some())
            .field("warn", &self.warn.name())
            .field("print", &self.print.name())
            .field("log", &self.log.name())
            .finish()
    }
}

impl ErrorConfig {
    pub fn with_mask(mut self, mask: ErrorMask) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_action(mut self, category: Category, action: Action) -> Self {
        self.mask.set(category, action);
        self
    }

    pub fn with_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_warn_sink(mut self, sink: impl Sink + 'static) -> Self {
        self.warn = Arc::new(sink);
        self
    }

    pub fn with_print_sink(mut self, sink: impl Sink + 'static) -> Self {
        self.print = Arc::new(sink);
        self
    }

    pub fn with_log_sink(mut self, sink: impl Sink + 'static) -> Self {
        self.log = Arc::new(sink);
        self
    }
}

#[derive(Debug, Error)]
pub enum FpError {
    #[error("floating point error: {0}")]
    Raise(Diagnostic),
    #[error("no error handler set for {0}")]
    MissingHandler(Diagnostic),
    #[error("error handler failed for {diagnostic}")]
    Handler {
        diagnostic: Diagnostic,
        #[source]
        source: BoxError,
    },
    #[error("failed to emit {diagnostic}")]
    Sink {
        diagnostic: Diagnostic,
        #[source]
        source: io::Error,
    },
}

/// Applies an [`ErrorConfig`] on behalf of one loop.
///
/// `warn`, `print` and `log` share a single "first" flag: after any of them fires, none of them
/// fire again for the life of the policy, whatever category trips next.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    config: ErrorConfig,
    name: String,
    first: bool,
}

impl ErrorPolicy {
    pub fn new(config: ErrorConfig, name: impl Into<String>) -> Self {
        Self {
            config,
            name: name.into(),
            first: true,
        }
    }

    #[inline]
    pub fn config(&self) -> &ErrorConfig {
        &self.config
    }

    #[inline]
    pub fn mask(&self) -> ErrorMask {
        self.config.mask
    }

    /// Applies the configured action of every category tripped in `status`, in checking order.
    /// Stops at the first action that fails.
    pub fn check(&mut self, status: FpStatus) -> Result<(), FpError> {
        for category in status.categories() {
            let action = self.config.mask.get(category);
            self.apply(category, action, status)?;
        }
        Ok(())
    }

    pub fn apply(&mut self, category: Category, action: Action, status: FpStatus) -> Result<(), FpError> {
        let diagnostic = || Diagnostic {
            category,
            name: self.name.clone(),
            status,
        };
        let sink = match action {
            Action::Ignore => return Ok(()),
            Action::Raise => return Err(FpError::Raise(diagnostic())),
            Action::Call => {
                let Some(handler) = &self.config.handler else {
                    return Err(FpError::MissingHandler(diagnostic()));
                };
                return handler
                    .call(category, status)
                    .map_err(|source| FpError::Handler {
                        diagnostic: diagnostic(),
                        source,
                    });
            }
            Action::Warn => &self.config.warn,
            Action::Print => &self.config.print,
            Action::Log => &self.config.log,
        };
        if !self.first {
            return Ok(());
        }
        self.first = false;

        let diagnostic = diagnostic();
        sink.emit(&diagnostic)
            .map_err(|source| FpError::Sink { diagnostic, source })
    }
}

thread_local! {
    static CONFIG: RefCell<ErrorConfig> = RefCell::new(ErrorConfig::default());
}

/// Returns the calling thread's error configuration.
pub fn get() -> ErrorConfig {
    CONFIG.with_borrow(|config| config.clone())
}

/// Replaces the calling thread's error configuration, returning the previous one.
pub fn set(config: ErrorConfig) -> ErrorConfig {
    CONFIG.with_borrow_mut(|current| std::mem::replace(current, config))
}

/// Overrides the calling thread's error configuration until the guard drops.
pub fn scoped(config: ErrorConfig) -> ScopedConfig {
    let previous = Some(set(config));
    ScopedConfig {
        previous,
        _thread: PhantomData,
    }
}

#[must_use = "the configuration is restored when the guard drops"]
pub struct ScopedConfig {
    previous: Option<ErrorConfig>,
    _thread: PhantomData<*const ()>,
}

impl Drop for ScopedConfig {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            set(previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::{
        Action, BoxError, Category, CollectSink, ErrorConfig, ErrorMask, ErrorPolicy, FpError, LogSink,
        StderrSink,
    };
    use crate::fpe::FpStatus;

    #[test]
    fn test_mask_bits() {
        let mask = ErrorMask::default();
        assert_eq!(mask.bits(), 4 | (4 << 3) | (4 << 9));
        assert_eq!(ErrorMask::from_bits(mask.bits()), Some(mask));
        assert_eq!(ErrorMask::IGNORE.bits(), 0);
        assert_eq!(ErrorMask::from_bits(7), None);

        let mask = ErrorMask::IGNORE.with(Category::Underflow, Action::Raise);
        assert_eq!(mask.bits(), 2 << 6);
        assert!(!mask.is_ignore());
    }

    #[test]
    fn test_shared_first_flag() -> Result<(), Box<dyn Error>> {
        let warn = CollectSink::new();
        let print = CollectSink::new();
        let config = ErrorConfig::default()
            .with_mask(ErrorMask::all(Action::Warn).with(Category::Invalid, Action::Print))
            .with_warn_sink(warn.clone())
            .with_print_sink(print.clone());
        let mut policy = ErrorPolicy::new(config, "add");

        policy.check(FpStatus::OVERFLOW | FpStatus::INVALID)?;
        policy.check(FpStatus::INVALID)?;
        policy.check(FpStatus::DIVIDE_BY_ZERO)?;
        assert_eq!(warn.lines(), vec!["Warning: overflow encountered in add\n".to_string()]);
        assert!(print.lines().is_empty());
        Ok(())
    }

    #[test]
    fn test_raise() {
        let config = ErrorConfig::default().with_action(Category::DivideByZero, Action::Raise);
        let mut policy = ErrorPolicy::new(config, "divide");
        match policy.check(FpStatus::DIVIDE_BY_ZERO) {
            Err(FpError::Raise(diagnostic)) => {
                assert_eq!(diagnostic.to_string(), "divide by zero encountered in divide")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(policy.check(FpStatus::UNDERFLOW).is_ok());
    }

    #[test]
    fn test_call() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler = {
            let count = count.clone();
            move |category: Category, status: FpStatus| -> Result<(), BoxError> {
                count.fetch_add(1, Ordering::SeqCst);
                match category {
                    Category::Invalid => Err("rejected".into()),
                    _ => {
                        assert!(status.contains(category.status()));
                        Ok(())
                    }
                }
            }
        };
        let config = ErrorConfig::default()
            .with_mask(ErrorMask::all(Action::Call))
            .with_handler(handler);
        let mut policy = ErrorPolicy::new(config, "sqrt");
        assert!(policy.check(FpStatus::OVERFLOW | FpStatus::UNDERFLOW).is_ok());
        assert!(matches!(
            policy.check(FpStatus::INVALID),
            Err(FpError::Handler { .. })
        ));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        let config = ErrorConfig::default().with_mask(ErrorMask::all(Action::Call));
        let mut policy = ErrorPolicy::new(config, "sqrt");
        assert!(matches!(
            policy.check(FpStatus::OVERFLOW),
            Err(FpError::MissingHandler(_))
        ));
    }

    #[test]
    fn test_scoped() {
        assert_eq!(super::get().mask, ErrorMask::default());
        {
            let _guard = super::scoped(ErrorConfig::default().with_mask(ErrorMask::IGNORE));
            assert!(super::get().mask.is_ignore());
        }
        assert_eq!(super::get().mask, ErrorMask::default());
    }

    #[test]
    fn test_default_sinks() {
        let config = ErrorConfig::default();
        assert_eq!(config.warn.name(), std::any::type_name::<StderrSink>());
        assert_eq!(config.print.name(), std::any::type_name::<StderrSink>());
        assert_eq!(config.log.name(), std::any::type_name::<LogSink>());
        assert!(config.handler.is_none());
    }
}
