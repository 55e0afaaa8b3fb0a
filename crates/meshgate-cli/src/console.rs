//! Console – an interactive producer on the command queue.
//!
//! Every line is parsed into the same [`Request`] a network client would
//! send, queued behind whatever is already waiting, and answered with the
//! same response timeout.
//!
//! | Command | Request |
//! |---|---|
//! | `discover` | `discover` |
//! | `send <address> <text…>` / `send <address> 0x<hex>` | `send` |
//! | `get <address\|local> <AT>` | `get_parameter` |
//! | `set <address\|local> <AT> <0x<hex>\|text> [noapply]` | `set_parameter` |
//! | `exec <address\|local> <AT> [value]` | `execute_command` |
//! | `wait <seconds>` | `wait` |
//! | `help` | – |
//! | `quit` / `exit` | – |

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;

use meshgate_middleware::{CommandQueue, CommandResult};
use meshgate_types::{Address64, AtCommand, CommandOutput, Payload, Request};

/// What one console line asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Request(Request),
    Help,
    Quit,
}

type Parser = fn(&[&str]) -> Result<ConsoleCommand, String>;

/// Name → (usage, parser).
const COMMANDS: &[(&str, &str, Parser)] = &[
    ("discover", "discover", parse_discover),
    ("send", "send <address> <text…|0xhex>", parse_send),
    ("get", "get <address|local> <AT>", parse_get),
    ("set", "set <address|local> <AT> <0xhex|text> [noapply]", parse_set),
    ("exec", "exec <address|local> <AT> [0xhex|text]", parse_exec),
    ("wait", "wait <seconds>", parse_wait),
    ("help", "help", parse_help),
    ("quit", "quit", parse_quit),
    ("exit", "exit", parse_quit),
];

/// Parse one line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((name, args)) = words.split_first() else {
        return Ok(None);
    };
    let name = name.to_ascii_lowercase();
    let (_, usage, parser) = COMMANDS
        .iter()
        .find(|(n, _, _)| *n == name)
        .ok_or_else(|| format!("unknown command '{name}'"))?;
    let command = parser(args).map_err(|e| format!("{e} (usage: {usage})"))?;
    if let ConsoleCommand::Request(request) = &command {
        request.validate().map_err(|e| e.to_string())?;
    }
    Ok(Some(command))
}

fn parse_help(_: &[&str]) -> Result<ConsoleCommand, String> {
    Ok(ConsoleCommand::Help)
}

fn parse_quit(_: &[&str]) -> Result<ConsoleCommand, String> {
    Ok(ConsoleCommand::Quit)
}

fn parse_discover(args: &[&str]) -> Result<ConsoleCommand, String> {
    if !args.is_empty() {
        return Err("discover takes no arguments".to_string());
    }
    Ok(ConsoleCommand::Request(Request::Discover))
}

fn parse_send(args: &[&str]) -> Result<ConsoleCommand, String> {
    let [address, message @ ..] = args else {
        return Err("missing address".to_string());
    };
    if message.is_empty() {
        return Err("missing message".to_string());
    }
    Ok(ConsoleCommand::Request(Request::Send {
        address: parse_address(address)?,
        message: parse_value(message)?,
    }))
}

fn parse_get(args: &[&str]) -> Result<ConsoleCommand, String> {
    let [target, at] = args else {
        return Err("expected a target and an AT command".to_string());
    };
    Ok(ConsoleCommand::Request(Request::GetParameter {
        address: parse_target(target)?,
        at_command: parse_at(at)?,
    }))
}

fn parse_set(args: &[&str]) -> Result<ConsoleCommand, String> {
    let (args, apply_changes) = match args.split_last() {
        Some((last, rest)) if last.eq_ignore_ascii_case("noapply") => (rest, false),
        _ => (args, true),
    };
    let [target, at, value @ ..] = args else {
        return Err("expected a target and an AT command".to_string());
    };
    if value.is_empty() {
        return Err("missing value".to_string());
    }
    Ok(ConsoleCommand::Request(Request::SetParameter {
        address: parse_target(target)?,
        at_command: parse_at(at)?,
        value: parse_value(value)?,
        apply_changes,
    }))
}

fn parse_exec(args: &[&str]) -> Result<ConsoleCommand, String> {
    let [target, at, value @ ..] = args else {
        return Err("expected a target and an AT command".to_string());
    };
    let value = if value.is_empty() {
        None
    } else {
        Some(parse_value(value)?)
    };
    Ok(ConsoleCommand::Request(Request::ExecuteCommand {
        address: parse_target(target)?,
        at_command: parse_at(at)?,
        value,
        apply_changes: true,
    }))
}

fn parse_wait(args: &[&str]) -> Result<ConsoleCommand, String> {
    let [seconds] = args else {
        return Err("expected one duration".to_string());
    };
    let time = seconds
        .parse::<f64>()
        .map_err(|_| format!("'{seconds}' is not a number of seconds"))?;
    Ok(ConsoleCommand::Request(Request::Wait { time }))
}

fn parse_address(raw: &str) -> Result<Address64, String> {
    raw.parse().map_err(|e: meshgate_types::GatewayError| e.to_string())
}

/// `local` targets the radio the gateway is attached to.
fn parse_target(raw: &str) -> Result<Option<Address64>, String> {
    if raw.eq_ignore_ascii_case("local") {
        Ok(None)
    } else {
        parse_address(raw).map(Some)
    }
}

fn parse_at(raw: &str) -> Result<AtCommand, String> {
    raw.to_ascii_uppercase()
        .parse()
        .map_err(|e: meshgate_types::GatewayError| e.to_string())
}

/// A single `0x…` word is hex; anything else is the words' text.
fn parse_value(words: &[&str]) -> Result<Payload, String> {
    if let [word] = words
        && let Some(digits) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X"))
    {
        return hex::decode(digits)
            .map(Payload::from)
            .map_err(|e| format!("bad hex value '{word}': {e}"));
    }
    Ok(Payload::from(words.join(" ").into_bytes()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Run the console on the calling thread until `quit`, end of input, or
/// `shutdown` is set. Commands are awaited on `runtime`.
pub fn run(
    queue: CommandQueue,
    response_timeout: Duration,
    runtime: Handle,
    shutdown: Arc<AtomicBool>,
) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Console unavailable".red(), e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline("meshgate> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let _ = editor.add_history_entry(line.as_str());

        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Help)) => print_help(),
            Ok(Some(ConsoleCommand::Quit)) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Ok(Some(ConsoleCommand::Request(request))) => {
                let op = request.op_name();
                let result = runtime.block_on(queue.call(request, response_timeout));
                print_result(op, &result);
            }
            Err(e) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                e,
                "help".bold()
            ),
        }
    }
    shutdown.store(true, Ordering::SeqCst);
}

fn print_help() {
    println!();
    println!("{}", "Console Commands".bold().underline());
    for (_, usage, _) in COMMANDS {
        println!("  {}", usage.bold().cyan());
    }
    println!("  Addresses are 16 hex digits; {} is the attached radio.", "local".bold());
    println!();
}

fn print_result(op: &str, result: &CommandResult) {
    match result {
        Ok(output) => {
            for line in describe_output(output) {
                println!("  {} {}", op.green(), line);
            }
        }
        Err(e) => println!("  {} {} ({:?})", op.red(), e, e.code()),
    }
}

fn describe_output(output: &CommandOutput) -> Vec<String> {
    match output {
        CommandOutput::Discovery(result) if result.devices.is_empty() => {
            vec!["no devices answered".to_string()]
        }
        CommandOutput::Discovery(result) => result
            .devices
            .iter()
            .map(|d| format!("{} {} {:?} '{}'", d.address, d.address16, d.role, d.id))
            .collect(),
        CommandOutput::Parameter { value: None } => vec!["ok".to_string()],
        CommandOutput::Parameter { value: Some(value) } => vec![describe_payload(value)],
        CommandOutput::Waited { time } => vec![format!("waited {time} s")],
        CommandOutput::Done {} => vec!["ok".to_string()],
    }
}

fn describe_payload(payload: &Payload) -> String {
    let bytes = payload.as_bytes();
    let hex = hex::encode_upper(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.is_empty() && text.chars().all(|c| !c.is_control()) => {
            format!("0x{hex} \"{text}\"")
        }
        _ => format!("0x{hex}"),
    }
}
