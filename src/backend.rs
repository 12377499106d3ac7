//! Inference backends driven by workers
//!
//! A backend knows nothing about transports or routing. It is initialised once
//! with its device set and then answers one request at a time on a blocking
//! thread. Streaming replies are returned as a lazy, finite iterator of text
//! fragments; batching them into results is the worker's job.

use crate::config::{BackendConfig, EchoConfig};
use crate::task::{Params, Turn};
use anyhow::Result;
use std::time::Duration;

/// Lazily produced reply fragments
pub type Fragments<'a> = Box<dyn Iterator<Item = Result<String>> + Send + 'a>;

pub trait Backend: Send {
    fn name(&self) -> &str;

    /// Called once by the worker before its first task
    fn init(&mut self, devices: &[u32]) -> Result<()>;

    /// One output per input text
    fn generate(&mut self, texts: &[String], params: &Params) -> Result<Vec<String>>;

    fn chat(&mut self, query: &str, history: &[Turn], params: &Params) -> Result<String>;

    fn chat_stream<'a>(
        &'a mut self,
        query: &str,
        history: &[Turn],
        params: &Params,
    ) -> Result<Fragments<'a>>;
}

/// Build the backend described by `config`
pub fn build(config: &BackendConfig) -> Box<dyn Backend> {
    match config {
        BackendConfig::Echo(echo) => Box::new(EchoBackend::new(echo.clone())),
    }
}

/// Deterministic backend that replies with its input.
///
/// Streams the reply one character per fragment.
pub struct EchoBackend {
    config: EchoConfig,
    devices: Vec<u32>,
}

impl EchoBackend {
    pub fn new(config: EchoConfig) -> Self {
        Self {
            config,
            devices: Vec::new(),
        }
    }

    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    fn check(&self, text: &str) -> Result<()> {
        if let Some(marker) = &self.config.fail_marker
            && text.contains(marker.as_str())
        {
            anyhow::bail!("input contains failure marker '{}'", marker);
        }
        Ok(())
    }

    fn reply(&self, query: &str) -> String {
        format!("{}{}", self.config.prefix, query)
    }
}

impl Backend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    fn init(&mut self, devices: &[u32]) -> Result<()> {
        self.devices = devices.to_vec();
        tracing::info!(devices = ?self.devices, "Echo backend initialised");
        Ok(())
    }

    fn generate(&mut self, texts: &[String], _params: &Params) -> Result<Vec<String>> {
        texts
            .iter()
            .map(|text| {
                self.check(text)?;
                Ok(self.reply(text))
            })
            .collect()
    }

    fn chat(&mut self, query: &str, _history: &[Turn], _params: &Params) -> Result<String> {
        self.check(query)?;
        Ok(self.reply(query))
    }

    fn chat_stream<'a>(
        &'a mut self,
        query: &str,
        _history: &[Turn],
        _params: &Params,
    ) -> Result<Fragments<'a>> {
        self.check(query)?;

        let delay = Duration::from_millis(self.config.fragment_delay_ms);
        let chars: Vec<char> = self.reply(query).chars().collect();

        Ok(Box::new(chars.into_iter().map(move |c| {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            Ok(c.to_string())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(prefix: &str, fail_marker: Option<&str>) -> EchoBackend {
        EchoBackend::new(EchoConfig {
            prefix: prefix.to_string(),
            fragment_delay_ms: 0,
            fail_marker: fail_marker.map(str::to_string),
        })
    }

    #[test]
    fn test_generate_echoes_each_text() {
        let mut backend = echo("> ", None);
        let out = backend
            .generate(&["a".to_string(), "b".to_string()], &Params::new())
            .unwrap();
        assert_eq!(out, vec!["> a", "> b"]);
    }

    #[test]
    fn test_stream_yields_characters() {
        let mut backend = echo("", None);
        let fragments: Vec<String> = backend
            .chat_stream("héllo", &[], &Params::new())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(fragments, vec!["h", "é", "l", "l", "o"]);
    }

    #[test]
    fn test_fail_marker() {
        let mut backend = echo("", Some("!boom"));
        assert!(backend.chat("please !boom", &[], &Params::new()).is_err());
        assert!(backend.chat_stream("!boom", &[], &Params::new()).is_err());
        assert!(backend.chat("fine", &[], &Params::new()).is_ok());
    }

    #[test]
    fn test_build_and_init() {
        let mut backend = build(&BackendConfig::default());
        assert_eq!(backend.name(), "echo");
        backend.init(&[1, 2]).unwrap();
    }
}
