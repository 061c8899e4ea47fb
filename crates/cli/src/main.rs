/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Thin command client for MTA glue scripts: sends one command line to
//! the engine and maps the first word of the reply onto the exit codes
//! the wrappers expect.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::exit;
use std::time::Duration;

const EXIT_PASS: i32 = 0;
const EXIT_FAIL: i32 = 1;
const EXIT_SOFTFAIL: i32 = 2;
const EXIT_NEUTRAL: i32 = 3;
const EXIT_PERMERROR: i32 = 4;
const EXIT_TEMPERROR: i32 = 5;
const EXIT_NONE: i32 = 6;
const EXIT_ACCEPT: i32 = 7;
const EXIT_REJECT: i32 = 8;
const EXIT_UNDEFINED: i32 = 9;

fn main() {
    let mut args = std::env::args().skip(1).peekable();
    let server = match args.peek() {
        Some(flag) if flag == "-s" || flag == "--server" => {
            args.next();
            args.next().unwrap_or_else(|| usage())
        }
        _ => std::env::var("POSTSHIELD_SERVER")
            .unwrap_or_else(|_| "127.0.0.1:9877".to_string()),
    };
    let command: Vec<String> = args.collect();
    if command.is_empty() {
        usage();
    }
    let line = quote_command(&command);

    let response = match send(&server, &line) {
        Ok(response) => response,
        Err(err) => {
            eprintln!("postshield-cli: {server}: {err}");
            exit(EXIT_TEMPERROR);
        }
    };
    print!("{response}");
    if !response.ends_with('\n') {
        println!();
    }
    exit(exit_code(&response));
}

fn usage() -> ! {
    eprintln!(
        "usage: postshield-cli [-s host:port] <COMMAND> [args…]\n\
         examples:\n\
         \x20 postshield-cli SPF 192.0.2.5 alice@example.com mx.example.com bob@test.tld\n\
         \x20 postshield-cli SPAM <ticket>\n\
         \x20 postshield-cli BLOCK ADD .spam.example"
    );
    exit(EXIT_UNDEFINED);
}

/// The SPF and CHECK verbs quote their positional arguments; everything
/// else passes through verbatim.
fn quote_command(command: &[String]) -> String {
    match command[0].as_str() {
        "SPF" | "CHECK" => {
            let mut line = command[0].clone();
            for arg in &command[1..] {
                line.push_str(&format!(" '{arg}'"));
            }
            line.push('\n');
            line
        }
        _ => format!("{}\n", command.join(" ")),
    }
}

fn send(server: &str, line: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(server)?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.set_write_timeout(Some(Duration::from_secs(30)))?;
    stream.write_all(line.as_bytes())?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

fn exit_code(response: &str) -> i32 {
    match response.split_whitespace().next().unwrap_or_default() {
        "PASS" => EXIT_PASS,
        "FAIL" => EXIT_FAIL,
        "SOFTFAIL" => EXIT_SOFTFAIL,
        "NEUTRAL" => EXIT_NEUTRAL,
        "PERMERROR" => EXIT_PERMERROR,
        "TEMPERROR" | "GREYLIST" | "LISTED" => EXIT_TEMPERROR,
        "NONE" => EXIT_NONE,
        "OK" | "ADDED" | "DROPPED" | "UPDATED" | "LAN" => EXIT_ACCEPT,
        "BLOCKED" | "SPAMTRAP" | "INVALID" | "NXDOMAIN" => EXIT_REJECT,
        _ => EXIT_UNDEFINED,
    }
}

#[cfg(test)]
mod tests {
    use super::{exit_code, quote_command};

    #[test]
    fn reply_to_exit_code() {
        assert_eq!(exit_code("PASS abc123\n"), 0);
        assert_eq!(exit_code("FAIL abc123\n"), 1);
        assert_eq!(exit_code("SOFTFAIL abc\n"), 2);
        assert_eq!(exit_code("NEUTRAL abc\n"), 3);
        assert_eq!(exit_code("PERMERROR\n"), 4);
        assert_eq!(exit_code("TEMPERROR\n"), 5);
        assert_eq!(exit_code("NONE abc\n"), 6);
        assert_eq!(exit_code("OK 192.0.2.5\n"), 7);
        assert_eq!(exit_code("BLOCKED\n"), 8);
        assert_eq!(exit_code("ERROR: TICKET EXPIRED\n"), 9);
    }

    #[test]
    fn spf_arguments_are_quoted() {
        let line = quote_command(&[
            "SPF".to_string(),
            "192.0.2.5".to_string(),
            "alice@example.com".to_string(),
        ]);
        assert_eq!(line, "SPF '192.0.2.5' 'alice@example.com'\n");

        let line = quote_command(&["SPAM".to_string(), "ticket".to_string()]);
        assert_eq!(line, "SPAM ticket\n");
    }
}
