//! Command execution.
//!
//! Commands run in order against an environment, with variable references substituted
//! just in time before dispatch. A loader-binding command must be the last command of
//! its list: anything after it is a configuration error and unbinds the loader.

use alloc::string::{String, ToString};

use hashbrown::HashMap;
use spin::Mutex;

use crate::config::{Command, CommandList, Environment, Value, ValueList};
use crate::errors::ConfigError;
use crate::fs::{HandleKind, OpenFlags};

/// A registered command implementation.
pub type CommandFn = fn(&mut Environment, ValueList) -> Result<(), ConfigError>;

lazy_static::lazy_static! {
    static ref COMMANDS: Mutex<HashMap<&'static str, CommandFn>> = Mutex::new(builtin_table());
}

fn builtin_table() -> HashMap<&'static str, CommandFn> {
    let mut table: HashMap<&'static str, CommandFn> = HashMap::new();

    table.insert("set", cmd_set);
    table.insert("unset", cmd_unset);
    table.insert("env", cmd_env);
    table.insert("ls", cmd_ls);
    table.insert("cd", cmd_cd);
    table.insert("cat", cmd_cat);
    table.insert("lsmemory", cmd_lsmemory);
    table.insert("reboot", cmd_reboot);
    table.insert("exit", cmd_exit);

    // One command per OS loader.
    #[cfg(feature = "x86_64")]
    {
        table.insert("kboot", crate::loader::kboot::kboot_cmd);
        table.insert("linux", crate::loader::linux::linux_cmd);
    }

    table
}

/// Registers an additional command (platform loaders, shell extensions).
pub fn register_command(name: &'static str, f: CommandFn) {
    COMMANDS.lock().insert(name, f);
}

/// Substitutes variable references in `value` against `env`, returning a deep copy.
///
/// - A [`Value::Reference`] becomes a copy of the referenced entry; an undefined
///   variable is a configuration error.
/// - In strings, `${name}` is replaced with the stringified value (integers in
///   decimal, booleans as `true`/`false`, strings verbatim); `\$` is a literal dollar
///   and suppresses expansion. Lists and command lists are not stringifiable.
/// - Lists substitute element-wise. Command lists are left alone: their commands
///   substitute when they execute.
pub fn substitute(value: &Value, env: &Environment) -> Result<Value, ConfigError> {
    match value {
        Value::Reference(name) => match env.lookup(name) {
            Some(found) => Ok(found.clone()),
            None => config_error!("variable '{name}' is not defined"),
        },
        Value::String(s) => Ok(Value::String(substitute_string(s, env)?)),
        Value::List(values) => {
            let mut out = ValueList::with_capacity(values.len());
            for v in values {
                out.push(substitute(v, env)?);
            }
            Ok(Value::List(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_string(s: &str, env: &Environment) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => config_error!("unterminated '${{' reference"),
                    }
                }

                match env.lookup(&name) {
                    Some(Value::Integer(i)) => out.push_str(&i.to_string()),
                    Some(Value::Boolean(b)) => out.push_str(if *b { "true" } else { "false" }),
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => {
                        config_error!("variable '{name}' ({}) is not a string", other.type_name())
                    }
                    None => config_error!("variable '{name}' is not defined"),
                }
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

/// Executes `cmds` in order against `env`.
///
/// Execution stops at the first error. A command encountered after a loader-binding
/// command is an error and removes the binding.
pub fn command_list_exec(cmds: &CommandList, env: &mut Environment) -> Result<(), ConfigError> {
    for cmd in cmds {
        if env.loader().is_some() {
            env.loader = None;
            return Err(at_command(
                cmd,
                alloc::format!("'{}': no command may follow an OS loader command", cmd.name),
            ));
        }

        let Some(f) = COMMANDS.lock().get(cmd.name.as_str()).copied() else {
            return Err(at_command(
                cmd,
                alloc::format!("unknown command '{}'", cmd.name),
            ));
        };

        let mut args = ValueList::with_capacity(cmd.args.len());
        for arg in &cmd.args {
            args.push(substitute(arg, env).map_err(|e| locate(cmd, e))?);
        }

        f(env, args).map_err(|e| locate(cmd, e))?;
    }

    Ok(())
}

fn at_command(cmd: &Command, message: String) -> ConfigError {
    ConfigError::new(message, cmd.line, cmd.column)
}

/// Fills a location-less error with the failing command's position.
fn locate(cmd: &Command, mut err: ConfigError) -> ConfigError {
    if err.line == 0 {
        err.line = cmd.line;
        err.column = cmd.column;
    }
    err
}

fn want_string(args: &ValueList, index: usize, what: &str) -> Result<String, ConfigError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => config_error!("expected {what} (string), got {}", other.type_name()),
        None => config_error!("missing {what} argument"),
    }
}

fn cmd_set(env: &mut Environment, mut args: ValueList) -> Result<(), ConfigError> {
    if args.len() != 2 {
        config_error!("set: expected a name and a value");
    }

    let name = want_string(&args, 0, "variable name")?;
    let value = args.pop().expect("length checked");
    env.set(&name, value)
}

fn cmd_unset(env: &mut Environment, args: ValueList) -> Result<(), ConfigError> {
    if args.len() != 1 {
        config_error!("unset: expected a variable name");
    }

    env.unset(&want_string(&args, 0, "variable name")?)
}

fn cmd_env(env: &mut Environment, _args: ValueList) -> Result<(), ConfigError> {
    for (name, value) in env.entries() {
        println!("{name} = {value}");
    }
    Ok(())
}

fn cmd_ls(env: &mut Environment, args: ValueList) -> Result<(), ConfigError> {
    let dir = if args.is_empty() {
        match env.directory() {
            Some(dir) => dir,
            None => open_checked(env, "/", Some(HandleKind::Directory))?,
        }
    } else {
        let path = want_string(&args, 0, "path")?;
        open_checked(env, &path, Some(HandleKind::Directory))?
    };

    let listed = crate::fs::iterate(&dir, &mut |entry| {
        match entry.handle.kind {
            HandleKind::Directory => println!("{}/", entry.name),
            HandleKind::Symlink => println!("{}@", entry.name),
            HandleKind::Regular => println!("{} ({} bytes)", entry.name, entry.handle.size),
        }
        true
    });

    if let Err(e) = listed {
        config_error!("ls: {e}");
    }
    Ok(())
}

fn cmd_cd(env: &mut Environment, args: ValueList) -> Result<(), ConfigError> {
    let path = want_string(&args, 0, "path")?;
    let dir = open_checked(env, &path, Some(HandleKind::Directory))?;
    env.set_directory(dir);
    Ok(())
}

fn cmd_cat(env: &mut Environment, args: ValueList) -> Result<(), ConfigError> {
    if args.is_empty() {
        config_error!("cat: expected at least one path");
    }

    for i in 0..args.len() {
        let path = want_string(&args, i, "path")?;
        let handle = open_checked(env, &path, Some(HandleKind::Regular))?;
        let data = crate::fs::read_whole(&handle)
            .map_err(|e| ConfigError::new(alloc::format!("{path}: {e}"), 0, 0))?;
        print!("{}", String::from_utf8_lossy(&data));
    }

    Ok(())
}

fn cmd_lsmemory(_env: &mut Environment, _args: ValueList) -> Result<(), ConfigError> {
    let shown = crate::mem::phys::with_global(|phys| {
        for range in phys.snapshot().ranges() {
            println!(
                "{} - {:#018x} {:?}",
                range.start,
                range.end(),
                range.range_type
            );
        }
    });

    if shown.is_none() {
        config_error!("physical memory manager is not initialised");
    }
    Ok(())
}

fn cmd_reboot(_env: &mut Environment, _args: ValueList) -> Result<(), ConfigError> {
    crate::platform::reboot()
}

fn cmd_exit(_env: &mut Environment, _args: ValueList) -> Result<(), ConfigError> {
    crate::platform::exit()
}

/// Opens a path relative to the environment, translating statuses into configuration
/// errors.
pub(crate) fn open_checked(
    env: &Environment,
    path: &str,
    kind: Option<HandleKind>,
) -> Result<alloc::sync::Arc<crate::fs::FsHandle>, ConfigError> {
    open_flags_checked(env, path, kind, OpenFlags::empty())
}

pub(crate) fn open_flags_checked(
    env: &Environment,
    path: &str,
    kind: Option<HandleKind>,
    flags: OpenFlags,
) -> Result<alloc::sync::Arc<crate::fs::FsHandle>, ConfigError> {
    crate::fs::open(&env.open_context(), path, kind, flags)
        .map_err(|e| ConfigError::new(alloc::format!("{path}: {e}"), 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_str;
    use crate::device::DeviceRegistry;
    use crate::fs::testfs::{self, TestTree};

    fn exec_str(input: &str, env: &mut Environment) -> Result<(), ConfigError> {
        command_list_exec(&parse_str(input).unwrap(), env)
    }

    #[test]
    fn set_and_unset_drive_the_entry_table() {
        let mut env = Environment::new(None);
        exec_str("set \"a\" 3\nset \"b\" \"x\"\nunset \"a\"\n", &mut env).unwrap();

        assert_eq!(env.lookup("a"), None);
        assert_eq!(env.lookup("b"), Some(&Value::String("x".into())));
    }

    #[test]
    fn reserved_names_error_out() {
        let mut env = Environment::new(None);
        let err = exec_str("set \"device\" \"hd1\"\n", &mut env).unwrap_err();
        assert!(err.message.contains("reserved"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn reference_substitution_copies_the_value() {
        let mut env = Environment::new(None);
        exec_str("set \"a\" 3\nset \"b\" $a\n", &mut env).unwrap();
        assert_eq!(env.lookup("b"), Some(&Value::Integer(3)));
    }

    #[test]
    fn undefined_reference_is_an_error() {
        let mut env = Environment::new(None);
        let err = exec_str("set \"b\" $nope\n", &mut env).unwrap_err();
        assert!(err.message.contains("nope"));
        assert_eq!(err.line, 1, "error located at the failing command");
    }

    #[test]
    fn string_substitution_stringifies_primitives() {
        let mut env = Environment::new(None);
        env.set("n", Value::Integer(3)).unwrap();
        env.set("flag", Value::Boolean(true)).unwrap();
        env.set("root", Value::String("hd0".into())).unwrap();

        assert_eq!(
            substitute_string("quiet ${n} ${flag} on ${root}", &env).unwrap(),
            "quiet 3 true on hd0"
        );
    }

    #[test]
    fn substitution_is_idempotent_without_references() {
        let env = Environment::new(None);
        let plain = "no references here, just text";
        assert_eq!(substitute_string(plain, &env).unwrap(), plain);
    }

    #[test]
    fn escaped_dollar_is_literal() {
        let env = Environment::new(None);
        assert_eq!(
            substitute_string("costs \\${n} dollars", &env).unwrap(),
            "costs ${n} dollars"
        );
    }

    #[test]
    fn lists_substitute_element_wise() {
        let mut env = Environment::new(None);
        env.set("n", Value::Integer(7)).unwrap();

        let out = substitute(
            &Value::List(alloc::vec![
                Value::Reference("n".into()),
                Value::String("v=${n}".into()),
            ]),
            &env,
        )
        .unwrap();

        let Value::List(items) = out else {
            panic!("expected list")
        };
        assert_eq!(items[0], Value::Integer(7));
        assert_eq!(items[1], Value::String("v=7".into()));
    }

    #[test]
    fn unknown_command_reports_location() {
        let mut env = Environment::new(None);
        let err = exec_str("set \"a\" 1\nfrobnicate\n", &mut env).unwrap_err();
        assert_eq!((err.line, err.column), (2, 1));
    }

    #[test]
    fn filesystem_commands_work_against_a_mount() {
        let tree = TestTree::dir(&[(
            "boot",
            TestTree::dir(&[("grub.txt", TestTree::file(b"hello"))]),
        )]);
        let mut registry = DeviceRegistry::new();
        let device = testfs::mount_tree(&mut registry, "exct0", tree, false);

        let mut env = Environment::new(None);
        env.set_device(&device);
        assert_eq!(env.lookup("device"), Some(&Value::String("exct0".into())));

        exec_str("cd \"/boot\"\ncat \"grub.txt\"\nls\n", &mut env).unwrap();

        let err = exec_str("cd \"/missing\"\n", &mut env).unwrap_err();
        assert!(err.message.contains("not found"));
    }
}
