// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer, Serialize};

use crate::ssbd::{SsbdParseError, SsbdState};

/// Name of the kernel command line parameter selecting the SSBD policy.
pub const SSBD_PARAM: &str = "ssbd";

/// Errors in the runtime mitigation options.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid `ssbd` parameter: {0}
    Ssbd(#[from] SsbdParseError),
}

/// Runtime mitigation options chosen by the operator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MitigationConfig {
    /// Speculative store bypass policy.
    #[serde(default, deserialize_with = "deserialize_ssbd")]
    pub ssbd: SsbdState,
}

fn deserialize_ssbd<'de, D>(deserializer: D) -> Result<SsbdState, D::Error>
where
    D: Deserializer<'de>,
{
    let val = String::deserialize(deserializer)?;
    val.parse().map_err(serde::de::Error::custom)
}

impl MitigationConfig {
    /// Extracts the mitigation options from a kernel command line.
    ///
    /// Only parameters before `--` are considered; later ones belong to init.
    /// When a parameter is repeated the last one wins.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = MitigationConfig::default();

        for param in cmdline.split_whitespace().take_while(|param| *param != "--") {
            let value = match param.split_once('=') {
                Some((key, value)) if key == SSBD_PARAM => value,
                None if param == SSBD_PARAM => "",
                _ => continue,
            };
            config.ssbd = value.parse()?;
        }

        Ok(config)
    }
}
