//! A small library to parse command-line and environmental flags.
//!
//! Flags are grouped by an owner type. Each flag registers itself at load time
//! (see [`define_flag!`](crate::define_flag)) and is later filled in by
//! [`parse`] or [`parse_with_prefix`].

use std::{
    any::TypeId,
    borrow::Cow,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

use crate::utils::parse_duration;

pub type FlagHandler = fn(bool);
pub type OptionHandler = fn(&str);

/// A value type a flag can hold.
pub trait FlagValue: Clone + Send + 'static {
    fn parse_flag(argument: &str) -> Option<Self>;
}

impl FlagValue for bool {
    fn parse_flag(argument: &str) -> Option<Self> {
        match argument {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

fn split_radix(argument: &str) -> (&str, u32) {
    if argument.len() > 2 && &argument[0..2] == "0x" {
        (&argument[2..], 16)
    } else if argument.len() > 1 && &argument[0..1] == "0" {
        (&argument[1..], 8)
    } else {
        (argument, 10)
    }
}

impl FlagValue for usize {
    fn parse_flag(argument: &str) -> Option<Self> {
        let (digits, radix) = split_radix(argument);
        usize::from_str_radix(digits, radix).ok()
    }
}

impl FlagValue for isize {
    fn parse_flag(argument: &str) -> Option<Self> {
        if let Some(rest) = argument.strip_prefix('-') {
            let (digits, radix) = split_radix(rest);
            return isize::from_str_radix(digits, radix).ok().map(|v| -v);
        }
        let (digits, radix) = split_radix(argument);
        isize::from_str_radix(digits, radix).ok()
    }
}

impl FlagValue for f64 {
    fn parse_flag(argument: &str) -> Option<Self> {
        argument.parse().ok()
    }
}

impl FlagValue for String {
    fn parse_flag(argument: &str) -> Option<Self> {
        Some(argument.to_owned())
    }
}

impl FlagValue for Duration {
    fn parse_flag(argument: &str) -> Option<Self> {
        parse_duration(argument)
    }
}

/// Storage for a single flag value. Created by `define_flag!`.
pub struct FlagCell<T> {
    value: Mutex<Option<T>>,
    is_set: AtomicBool,
}

impl<T: FlagValue> FlagCell<T> {
    pub const fn new() -> Self {
        Self {
            value: Mutex::new(None),
            is_set: AtomicBool::new(false),
        }
    }

    #[doc(hidden)]
    pub fn init(&self, default_value: T) {
        let mut value = self.value.lock();
        if value.is_none() {
            *value = Some(default_value);
        }
    }

    /// Current value. Falls back to `default` if called before the flag was
    /// registered (e.g. from another load-time constructor).
    pub fn get_or(&self, default: impl FnOnce() -> T) -> T {
        self.value.lock().clone().unwrap_or_else(default)
    }

    pub fn set(&self, value: T) {
        *self.value.lock() = Some(value);
        self.is_set.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Relaxed)
    }
}

trait ErasedFlag: Sync {
    fn set_from_str(&self, argument: &str) -> bool;
    fn is_set(&self) -> bool;
    fn is_bool(&self) -> bool;
}

impl<T: FlagValue> ErasedFlag for FlagCell<T> {
    fn set_from_str(&self, argument: &str) -> bool {
        match T::parse_flag(argument) {
            Some(value) => {
                self.set(value);
                true
            }
            None => false,
        }
    }

    fn is_set(&self) -> bool {
        FlagCell::is_set(self)
    }

    fn is_bool(&self) -> bool {
        TypeId::of::<T>() == TypeId::of::<bool>()
    }
}

enum FlagTarget {
    Value(&'static dyn ErasedFlag),
    FlagHandler(FlagHandler, AtomicBool),
    OptionHandler(OptionHandler, AtomicBool),
}

struct Flag {
    name: &'static str,
    #[allow(dead_code)]
    comment: &'static str,
    short: Option<&'static str>,
    target: FlagTarget,
}

impl Flag {
    fn is_set(&self) -> bool {
        match &self.target {
            FlagTarget::Value(cell) => cell.is_set(),
            FlagTarget::FlagHandler(_, set) | FlagTarget::OptionHandler(_, set) => {
                set.load(Ordering::Relaxed)
            }
        }
    }

    fn set_from_string(&self, argument: &str) -> bool {
        match &self.target {
            FlagTarget::Value(cell) => cell.set_from_str(argument),
            FlagTarget::FlagHandler(handler, set) => {
                let Some(value) = bool::parse_flag(argument) else {
                    return false;
                };
                handler(value);
                set.store(true, Ordering::Relaxed);
                true
            }
            FlagTarget::OptionHandler(handler, set) => {
                handler(argument);
                set.store(true, Ordering::Relaxed);
                true
            }
        }
    }

    fn takes_bool(&self) -> bool {
        match &self.target {
            FlagTarget::Value(cell) => cell.is_bool(),
            FlagTarget::FlagHandler(..) => true,
            FlagTarget::OptionHandler(..) => false,
        }
    }
}

struct Flags {
    owner: TypeId,
    flags: Vec<Flag>,
    initialized: bool,
}

/// Registered flags, grouped by owner type.
static FLAGS: Mutex<Vec<Flags>> = Mutex::new(Vec::new());

fn with_flags_of<T: 'static, R>(f: impl FnOnce(Option<&mut Flags>) -> R) -> R {
    let mut all = FLAGS.lock();
    let owner = TypeId::of::<T>();
    f(all.iter_mut().find(|flags| flags.owner == owner))
}

fn add_flag<T: 'static>(flag: Flag) {
    let mut all = FLAGS.lock();
    let owner = TypeId::of::<T>();
    let flags = match all.iter().position(|flags| flags.owner == owner) {
        Some(index) => &mut all[index],
        None => {
            all.push(Flags {
                owner,
                flags: Vec::new(),
                initialized: false,
            });
            let last = all.len() - 1;
            &mut all[last]
        }
    };

    if flags.flags.iter().all(|existing| existing.name != flag.name) {
        flags.flags.push(flag);
    }
}

pub struct FlagsOf<T>(PhantomData<T>);

impl<T: 'static> FlagsOf<T> {
    pub fn is_set(name: &str) -> bool {
        with_flags_of::<T, _>(|flags| {
            flags
                .and_then(|flags| flags.flags.iter().find(|flag| flag.name == name))
                .map(Flag::is_set)
                .unwrap_or(false)
        })
    }

    /// Names of every flag registered for `T`.
    pub fn names() -> Vec<&'static str> {
        with_flags_of::<T, _>(|flags| {
            flags
                .map(|flags| flags.flags.iter().map(|flag| flag.name).collect())
                .unwrap_or_default()
        })
    }

    fn parse_one(option: &str, short: bool) -> Result<(), FlagError> {
        let (raw_name, argument) = match option.find('=') {
            Some(equals_pos) => (&option[..equals_pos], Some(&option[equals_pos + 1..])),
            None => (option, None),
        };

        let mut name = raw_name.replace('-', "_");
        let mut argument = argument.map(Cow::Borrowed);

        let found = with_flags_of::<T, _>(|flags| {
            let flags = flags?;
            let lookup = |name: &str| {
                flags.flags.iter().position(|flag| {
                    if short {
                        flag.short == Some(name)
                    } else {
                        flag.name == name
                    }
                })
            };

            if let Some(index) = lookup(&name) {
                return Some(index);
            }

            // `--no-name` and `--no_name` switch a boolean flag off.
            let stripped = name.strip_prefix("no_")?.to_owned();
            let index = lookup(&stripped)?;
            if argument.is_none() && flags.flags[index].takes_bool() {
                name = stripped;
                argument = Some(Cow::Borrowed("false"));
                Some(index)
            } else {
                None
            }
        });

        if found.is_none() {
            return Err(FlagError::FlagNotFound(name));
        }

        let argument = argument.unwrap_or(Cow::Borrowed("true"));
        let accepted = with_flags_of::<T, _>(|flags| {
            flags
                .and_then(|flags| flags.flags.iter().find(|flag| {
                    if short {
                        flag.short == Some(name.as_str())
                    } else {
                        flag.name == name
                    }
                }))
                .map(|flag| flag.set_from_string(&argument))
                .unwrap_or(false)
        });

        if !accepted {
            log::warn!(
                "Ignoring flag: {} is an invalid value for flag {}",
                argument,
                name
            );
        }

        Ok(())
    }

    fn process_command_line_flags(
        prefix: Option<&str>,
        flags: impl Iterator<Item = String>,
    ) -> Result<(), FlagError> {
        let mut flags_vec = flags.collect::<Vec<String>>();
        flags_vec.sort();

        let long_prefix = prefix
            .map(|prefix| Cow::Owned(format!("--{}:", prefix)))
            .unwrap_or(Cow::Borrowed("--"));
        let short_prefix = prefix
            .map(|prefix| Cow::Owned(format!("-{}:", prefix)))
            .unwrap_or(Cow::Borrowed("-"));

        for flag in &flags_vec {
            if is_valid_flag(flag, &long_prefix) {
                Self::parse_one(&flag[long_prefix.len()..], false)?;
            } else if is_valid_flag(flag, &short_prefix) && !flag.starts_with("--") {
                Self::parse_one(&flag[short_prefix.len()..], true)?;
            }
        }

        with_flags_of::<T, _>(|flags| {
            if let Some(flags) = flags {
                flags.initialized = true;
            }
        });
        Ok(())
    }

    fn process_environmental_vars(prefix: Option<&str>, vars: impl Iterator<Item = (String, String)>) {
        let env_prefix = prefix
            .map(|prefix| format!("{}_", prefix.to_uppercase()))
            .unwrap_or_default();

        for (option, argument) in vars {
            let Some(name) = option.strip_prefix(env_prefix.as_str()) else {
                continue;
            };
            let name = name.to_lowercase();
            let known = with_flags_of::<T, _>(|flags| {
                flags
                    .and_then(|flags| flags.flags.iter().find(|flag| flag.name == name))
                    .map(|flag| flag.set_from_string(&argument))
            });

            if known == Some(false) {
                log::warn!(
                    "Ignoring flag: {} is an invalid value for flag {}",
                    argument,
                    name
                );
            }
        }
    }
}

fn is_valid_flag(name: &str, prefix: &str) -> bool {
    name.len() > prefix.len() && &name[0..prefix.len()] == prefix
}

fn check_not_initialized<T: 'static>() -> Result<(), FlagError> {
    with_flags_of::<T, _>(|flags| match flags {
        None => Err(FlagError::NoFlags(std::any::type_name::<T>())),
        Some(flags) if flags.initialized => Err(FlagError::FlagsAlreadyInitialized(
            std::any::type_name::<T>(),
        )),
        Some(_) => Ok(()),
    })
}

/// Parse flags owned by `T` from `args` and `env`. Command-line flags win over
/// environment variables.
pub fn parse<T: 'static>(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    check_not_initialized::<T>()?;
    FlagsOf::<T>::process_environmental_vars(None, env);
    FlagsOf::<T>::process_command_line_flags(None, args)
}

/// Like [`parse`], but flags are spelled `--prefix:name` and environment
/// variables `PREFIX_NAME`.
pub fn parse_with_prefix<T: 'static>(
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    check_not_initialized::<T>()?;
    FlagsOf::<T>::process_environmental_vars(Some(prefix), env);
    FlagsOf::<T>::process_command_line_flags(Some(prefix), args)
}

#[doc(hidden)]
pub fn register<T: 'static, V: FlagValue>(
    cell: &'static FlagCell<V>,
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
) {
    add_flag::<T>(Flag {
        name,
        comment,
        short,
        target: FlagTarget::Value(cell),
    });
}

#[doc(hidden)]
pub fn register_handler<T: 'static>(
    handler: OptionHandler,
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
) {
    add_flag::<T>(Flag {
        name,
        comment,
        short,
        target: FlagTarget::OptionHandler(handler, AtomicBool::new(false)),
    });
}

#[doc(hidden)]
pub fn register_flag_handler<T: 'static>(
    handler: FlagHandler,
    name: &'static str,
    comment: &'static str,
    short: Option<&'static str>,
) {
    add_flag::<T>(Flag {
        name,
        comment,
        short,
        target: FlagTarget::FlagHandler(handler, AtomicBool::new(false)),
    });
}

#[doc(hidden)]
pub use ctor::ctor;
#[doc(hidden)]
pub use paste;

#[macro_export]
macro_rules! define_flag {
    ($of: ident => $typ: ident, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::define_flag!(@impl $of => $typ, $name, None, $default_value, $comment);
    };

    ($of: ident => $typ: ident, $name: ident, $short: literal, $default_value: expr, $comment: literal) => {
        $crate::define_flag!(@impl $of => $typ, $name, Some($short), $default_value, $comment);
    };

    (@impl $of: ident => $typ: ident, $name: ident, $short: expr, $default_value: expr, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            static [<$of:upper _FLAG_ $name:upper>]: $crate::utils::flags::FlagCell<$typ> =
                $crate::utils::flags::FlagCell::new();

            #[doc(hidden)]
            #[ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                [<$of:upper _FLAG_ $name:upper>].init($default_value);
                $crate::utils::flags::register::<$of, $typ>(
                    &[<$of:upper _FLAG_ $name:upper>],
                    stringify!($name),
                    $comment,
                    $short,
                );
            }

            #[doc = $comment]
            pub fn [<$of:lower _ $name>]() -> $typ {
                [<$of:upper _FLAG_ $name:upper>].get_or(|| $default_value)
            }

            pub fn [<set_ $of:lower _ $name>]($name: $typ) {
                [<$of:upper _FLAG_ $name:upper>].set($name);
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                [<$of:upper _FLAG_ $name:upper>].is_set()
            }
        }
    };
}

#[macro_export]
macro_rules! define_flag_handler {
    ($of: ident => $handler: expr, $name: ident, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            #[doc(hidden)]
            #[ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register_flag_handler::<$of>($handler, stringify!($name), $comment, None);
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };
}

#[macro_export]
macro_rules! define_option_handler {
    ($of: ident => $handler: expr, $name: ident, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            #[doc(hidden)]
            #[ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register_handler::<$of>($handler, stringify!($name), $comment, None);
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };
}

#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    #[error("unknown flag: {0}")]
    FlagNotFound(String),
    #[error("flags of {0} were already parsed")]
    FlagsAlreadyInitialized(&'static str),
    #[error("no flags registered for {0}")]
    NoFlags(&'static str),
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct TestFlags;

    crate::define_flag!(TestFlags => usize, workers, 4, "Number of workers");
    crate::define_flag!(TestFlags => bool, verbose, true, "Chatty output");
    crate::define_flag!(TestFlags => Duration, poll, Duration::from_millis(100), "Poll period");
    crate::define_flag!(TestFlags => String, label, String::from("none"), "A label");

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn on_mode(value: &str) {
        SEEN.store(value.len(), Ordering::Relaxed);
    }

    crate::define_option_handler!(TestFlags => on_mode, mode, "Mode selector");

    #[test]
    fn parses_command_line_and_env() {
        assert_eq!(testflags_workers(), 4);
        assert!(testflags_verbose());
        assert!(!is_testflags_workers_set());

        let args = [
            "--workers=0x10",
            "--no-verbose",
            "--mode=fast",
            "positional",
            "--poll=5ms",
        ]
        .into_iter()
        .map(String::from);
        let env = [("LABEL".to_owned(), "from-env".to_owned())].into_iter();

        parse::<TestFlags>(args, env).unwrap();

        assert_eq!(testflags_workers(), 16);
        assert!(is_testflags_workers_set());
        assert!(!testflags_verbose());
        assert_eq!(testflags_poll(), Duration::from_millis(5));
        assert_eq!(testflags_label(), "from-env");
        assert!(is_testflags_mode_set());
        assert_eq!(SEEN.load(Ordering::Relaxed), 4);
        assert!(FlagsOf::<TestFlags>::names().contains(&"poll"));

        assert!(matches!(
            parse::<TestFlags>(std::iter::empty(), std::iter::empty()),
            Err(FlagError::FlagsAlreadyInitialized(_))
        ));
    }

    struct EmptyFlags;

    #[test]
    fn unknown_owner() {
        assert!(matches!(
            parse::<EmptyFlags>(std::iter::empty(), std::iter::empty()),
            Err(FlagError::NoFlags(_))
        ));
    }
}
