// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for picking apart and filtering framework command lines.
//!
//! Options are matched by name. An entry in an option list that ends with `*` matches any
//! option starting with the rest of the entry, so `--cov*` matches `--cov`, `--cov=src` and
//! `--cov-report=term`. Options not named in any list are preserved verbatim and assumed to not
//! take a value.

/// The mode arguments are being built for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArgsMode {
    /// Collecting tests without running them.
    Discover,

    /// Running tests.
    Run,
}

/// Returns every value passed to `option`.
///
/// Accepts the `--opt value`, `--opt=value` and `-o value` forms.
pub fn option_values(args: &[String], option: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }
        if arg == option {
            if let Some(value) = iter.next() {
                values.push(value.clone());
            }
        } else if let Some(value) = arg
            .strip_prefix(option)
            .and_then(|rest| rest.strip_prefix('='))
        {
            values.push(value.to_owned());
        }
    }
    values
}

/// Returns the last value passed to any of `options`, or `None` if none of them were passed.
pub fn last_option_value(args: &[String], options: &[&str]) -> Option<String> {
    // Walk the command line once so that the last occurrence wins regardless of spelling.
    let mut last = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }
        for option in options {
            if arg == option {
                last = iter.next().cloned();
                break;
            } else if let Some(value) = arg
                .strip_prefix(option)
                .and_then(|rest| rest.strip_prefix('='))
            {
                last = Some(value.to_owned());
                break;
            }
        }
    }
    last
}

/// Returns the positional arguments in `args`.
///
/// `options_with_args` lists options that consume the following argument as their value (unless
/// written as `--opt=value`). Everything after a bare `--` is positional.
pub fn positional_arguments(
    args: &[String],
    options_with_args: &[&str],
    options_without_args: &[&str],
) -> Vec<String> {
    let mut positionals = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            positionals.extend(iter.cloned());
            break;
        }
        if !is_option(arg) {
            positionals.push(arg.clone());
            continue;
        }
        // Flags and unknown options never consume the next argument.
        if takes_separate_value(arg, options_with_args, options_without_args) {
            iter.next();
        }
    }
    positionals
}

/// Removes the named options (and their values, where applicable) from `args`.
///
/// Positional arguments and unknown options are preserved in order.
pub fn filter_arguments(
    args: &[String],
    options_with_args: &[&str],
    options_without_args: &[&str],
) -> Vec<String> {
    let mut filtered = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            filtered.push(arg.clone());
            filtered.extend(iter.cloned());
            break;
        }
        if !is_option(arg) {
            filtered.push(arg.clone());
            continue;
        }
        if takes_separate_value(arg, options_with_args, options_without_args) {
            iter.next();
        } else if !matches_any(arg, options_with_args) && !matches_any(arg, options_without_args)
        {
            filtered.push(arg.clone());
        }
    }
    filtered
}

/// Removes every positional argument from `args`, keeping options and their values.
pub fn remove_positional_arguments(args: &[String], options_with_args: &[&str]) -> Vec<String> {
    let mut kept = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }
        if !is_option(arg) {
            continue;
        }
        kept.push(arg.clone());
        if takes_separate_value(arg, options_with_args, &[]) {
            if let Some(value) = iter.next() {
                kept.push(value.clone());
            }
        }
    }
    kept
}

/// Splits a shell-quoted argument string into arguments.
pub fn split_args(args: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(args)
}

fn is_option(arg: &str) -> bool {
    arg.len() > 1 && arg.starts_with('-')
}

/// Returns true if `arg` is one of `options_with_args` written without an inline `=value`.
fn takes_separate_value(arg: &str, options_with_args: &[&str], flags: &[&str]) -> bool {
    !arg.contains('=') && matches_any(arg, options_with_args) && !flags.contains(&arg)
}

fn matches_any(arg: &str, options: &[&str]) -> bool {
    options.iter().any(|option| matches_option(arg, option))
}

fn matches_option(arg: &str, option: &str) -> bool {
    match option.strip_suffix('*') {
        Some(prefix) => arg.starts_with(prefix),
        None => {
            arg == option
                || arg
                    .strip_prefix(option)
                    .is_some_and(|rest| rest.starts_with('='))
        }
    }
}
