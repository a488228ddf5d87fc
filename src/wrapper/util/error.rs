/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;

pub type DynError = Box<dyn Error + Send + Sync>;
pub type DynResult<T> = Result<T, DynError>;

#[derive(Debug)]
struct ContextError {
    context: String,
    source: DynError,
}

impl ContextError {
    fn new(context: impl Into<String>, source: impl Into<DynError>) -> Self {
        Self {
            context: context.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SimpleError {}

pub fn with_context<E>(error: E, context: impl Into<String>) -> DynError
where
    E: Into<DynError>,
{
    Box::new(ContextError::new(context, error))
}

pub fn new_error(message: impl Into<String>) -> DynError {
    Box::new(SimpleError(message.into()))
}

/// Stage of the wrapper that produced an error. Selects the CNI error code
/// reported to the runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Config,
    Environment,
    Serialization,
    Lock,
    RuleApplication,
    StateStore,
}

impl ErrorKind {
    pub fn cni_code(self) -> u32 {
        match self {
            ErrorKind::Environment => 4,
            ErrorKind::StateStore => 5,
            ErrorKind::Serialization => 6,
            ErrorKind::Config => 7,
            ErrorKind::Lock => 11,
            ErrorKind::RuleApplication => 999,
        }
    }
}

#[derive(Debug)]
pub struct WrapperError {
    kind: ErrorKind,
    message: String,
    source: Option<DynError>,
}

impl WrapperError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for WrapperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Error for WrapperError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn Error + 'static))
    }
}

pub fn classified(kind: ErrorKind, message: impl Into<String>) -> DynError {
    Box::new(WrapperError {
        kind,
        message: message.into(),
        source: None,
    })
}

pub fn classified_with_context<E>(kind: ErrorKind, error: E, context: impl Into<String>) -> DynError
where
    E: Into<DynError>,
{
    Box::new(WrapperError {
        kind,
        message: context.into(),
        source: Some(error.into()),
    })
}

/// Returns the wrapper stage recorded on `error`, if it was raised by the wrapper itself.
pub fn error_kind(error: &(dyn Error + Send + Sync + 'static)) -> Option<ErrorKind> {
    error.downcast_ref::<WrapperError>().map(WrapperError::kind)
}

/// Several independent failures collected while tearing a container down.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<DynError>,
}

impl AggregateError {
    pub fn errors(&self) -> &[DynError] {
        &self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl Error for AggregateError {}

/// Collapses collected errors: none is success, a single error is returned
/// as-is, several become an [`AggregateError`].
pub fn aggregate(mut errors: Vec<DynError>) -> DynResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Box::new(AggregateError { errors })),
    }
}
