//! Machine naming and inventory filtering.

use std::time::{SystemTime, UNIX_EPOCH};

use quarry_core::config::RunnerConfig;
use rand::RngCore;

/// Generate a unique machine name for the runner:
/// `runner-<slug>-<template>` with the template's `%s` replaced by
/// `<unix-seconds>-<hex4>`.
pub fn new_machine_name(config: &RunnerConfig, template: &str) -> String {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut random = [0u8; 4];
    rand::rng().fill_bytes(&mut random);

    let suffix = format!("{unix}-{}", hex::encode(random));
    format!(
        "runner-{}-{}",
        dns1123_slug(&config.short_description()),
        template.replacen("%s", &suffix, 1)
    )
}

/// Keep only names this runner could have generated.
pub fn filter_machine_list(machines: Vec<String>, config: &RunnerConfig, template: &str) -> Vec<String> {
    let (prefix, suffix) = template.split_once("%s").unwrap_or((template, ""));
    let prefix = format!("runner-{}-{}", dns1123_slug(&config.short_description()), prefix);

    machines
        .into_iter()
        .filter(|name| name.starts_with(&prefix) && name.ends_with(suffix))
        .collect()
}

/// Lowercase DNS-1123 label: `[a-z0-9-]`, everything else folded to `-`.
fn dns1123_slug(value: &str) -> String {
    let slug: String = value
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}
