//! Named runtime flags settable through a `/Ctl` file.
//!
//! A control line names a flag and optionally a value:
//!
//! ```text
//! debug            turn debug on
//! nodebug          turn debug off
//! debug on|off     also 1|0, y|n, yes|no
//! clear            run the `clear` command
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// A command run when its flag is written. It gets the words after the flag name.
pub type Command = Arc<dyn Fn(&[&str]) -> Result<()> + Send + Sync>;

#[derive(Clone)]
enum Value {
    Bool(Arc<AtomicBool>),
    Cmd(Command),
}

#[derive(Clone)]
struct Flag {
    value: Value,
    read_only: bool,
}

/// A registry of flags. Boolean flags are shared [`AtomicBool`]s, so the code they control
/// reads them without going through the registry.
#[derive(Default)]
pub struct Flags {
    flags: RwLock<BTreeMap<String, Flag>>,
}

fn parse_bool(name: &str, v: &str) -> Result<bool> {
    match v {
        "on" | "1" | "y" | "yes" => Ok(true),
        "off" | "0" | "n" | "no" => Ok(false),
        _ => Err(Error::BadCtl(format!("usage: {name} on|off"))),
    }
}

impl Flags {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a boolean flag that can be set through [`ctl`](Self::ctl).
    pub fn add_bool(&self, name: &str, v: Arc<AtomicBool>) {
        self.add(name, Value::Bool(v), false);
    }

    /// Adds a boolean flag that is only reported.
    pub fn add_ro_bool(&self, name: &str, v: Arc<AtomicBool>) {
        self.add(name, Value::Bool(v), true);
    }

    /// Adds a command flag.
    pub fn add_cmd<F>(&self, name: &str, f: F)
    where
        F: Fn(&[&str]) -> Result<()> + Send + Sync + 'static,
    {
        self.add(name, Value::Cmd(Arc::new(f)), false);
    }

    fn add(&self, name: &str, value: Value, read_only: bool) {
        self.flags
            .write()
            .insert(name.to_owned(), Flag { value, read_only });
    }

    /// The value of a boolean flag.
    pub fn get(&self, name: &str) -> Option<bool> {
        match &self.flags.read().get(name)?.value {
            Value::Bool(b) => Some(b.load(Ordering::Relaxed)),
            Value::Cmd(_) => None,
        }
    }

    /// Applies one control line.
    pub fn ctl(&self, line: &str) -> Result<()> {
        let toks: Vec<&str> = line.split_whitespace().collect();
        let Some((&first, args)) = toks.split_first() else {
            return Err(Error::BadCtl("empty ctl".to_owned()));
        };
        let (flag, name, implied) = {
            let flags = self.flags.read();
            if let Some(f) = flags.get(first) {
                (f.clone(), first, true)
            } else if let Some(f) = first.strip_prefix("no").and_then(|n| flags.get(n)) {
                (f.clone(), &first[2..], false)
            } else {
                return Err(Error::BadCtl(format!("{first}: no such flag")));
            }
        };
        if flag.read_only {
            return Err(Error::BadCtl(format!("{name}: read only flag")));
        }
        match flag.value {
            Value::Cmd(f) => f(args),
            Value::Bool(b) => {
                let on = match (args, implied) {
                    ([], on) => on,
                    ([v], true) => parse_bool(name, v)?,
                    _ => return Err(Error::BadCtl(format!("usage: {name} on|off"))),
                };
                b.store(on, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}

impl fmt::Display for Flags {
    /// One `name on|off` line per boolean flag.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, flag) in self.flags.read().iter() {
            if let Value::Bool(b) = &flag.value {
                let v = if b.load(Ordering::Relaxed) { "on" } else { "off" };
                writeln!(f, "{name} {v}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn flags() -> (Flags, Arc<AtomicBool>, Arc<AtomicBool>) {
        let (dbg, ro) = (Arc::new(AtomicBool::new(false)), Arc::new(AtomicBool::new(true)));
        let f = Flags::new();
        f.add_bool("debug", Arc::clone(&dbg));
        f.add_ro_bool("noperm", Arc::clone(&ro));
        (f, dbg, ro)
    }

    #[test]
    fn bool_grammar() {
        let (f, dbg, _) = flags();
        f.ctl("debug").unwrap();
        assert!(dbg.load(Ordering::Relaxed));
        f.ctl("nodebug").unwrap();
        assert!(!dbg.load(Ordering::Relaxed));
        f.ctl("debug yes").unwrap();
        assert_eq!(f.get("debug"), Some(true));
        f.ctl("debug 0").unwrap();
        assert_eq!(f.get("debug"), Some(false));
        assert!(f.ctl("debug maybe").is_err());
        assert!(f.ctl("nodebug on").is_err());
    }

    #[test]
    fn names_starting_with_no_are_found() {
        let (f, _, _) = flags();
        let err = f.ctl("noperm").unwrap_err();
        assert!(err.to_string().contains("read only"), "{err}");
    }

    #[test]
    fn unknown_and_empty() {
        let (f, _, _) = flags();
        assert!(matches!(f.ctl("bogus"), Err(Error::BadCtl(_))));
        assert!(matches!(f.ctl("   "), Err(Error::BadCtl(_))));
    }

    #[test]
    fn commands_run() {
        let f = Flags::new();
        let n = Arc::new(AtomicUsize::new(0));
        let n2 = Arc::clone(&n);
        f.add_cmd("clear", move |args| {
            n2.fetch_add(1 + args.len(), Ordering::Relaxed);
            Ok(())
        });
        f.ctl("clear").unwrap();
        f.ctl("clear a b").unwrap();
        assert_eq!(n.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn report_lists_bools() {
        let (f, _, _) = flags();
        assert_eq!(f.to_string(), "debug off\nnoperm on\n");
    }
}
