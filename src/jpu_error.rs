/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::fmt::Display;
use std::io::ErrorKind;
use std::num::TryFromIntError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
#[non_exhaustive]
/// Well-defined errors returned by the session, header and frame-job engine
pub enum ErrorCode {
    /// Unrecoverable failure, for example the cross-process lock could not be acquired.
    Failure = 1,

    /// A parameter was out of range or inconsistent with the session.
    InvalidParameter = 2,

    /// The session handle does not refer to a slot that is open in this device.
    InvalidHandle = 3,

    /// No free session slot is left in the instance pool.
    ResourceExhausted = 4,

    /// The operation needs the previous frame job to be collected first.
    FrameNotComplete = 5,

    /// The API was called out of the required order.
    WrongCallSequence = 6,

    /// The decoder does not have enough buffered input to start a frame.
    BitEmpty = 7,

    /// The header parser ran out of data before finding the entropy coded segment.
    BitstreamStarved = 8,

    /// The frame header or its entropy coded segment runs past the physical end
    /// of the stream ring and has to be moved to the front before parsing again.
    BitstreamWrap = 9,

    /// The bitstream contains a marker or segment that is not valid JPEG.
    MalformedHeader = 10,

    /// The picture dimensions exceed what the hardware supports.
    UnsupportedPicture = 11,

    /// The scan uses a coding profile other than baseline or extended sequential.
    UnsupportedProfile = 12,

    /// A huffman table is over-subscribed or references invalid symbols.
    InvalidHuffmanTable = 13,

    /// The feature needs a hardware capability that this chip revision lacks.
    NotSupported = 14,

    /// The hardware did not signal completion within the timeout.
    HardwareTimeout = 15,

    /// The decoder was started after the end of the stream was reached.
    EndOfStream = 16,

    /// Fewer frame buffers were registered than the decoder needs.
    InsufficientFrameBuffers = 17,

    /// The frame buffer stride is not a multiple of 8.
    InvalidStride = 18,

    /// The bit cursor was asked for more bits than remain in its buffer.
    InsufficientBits = 19,

    /// An error was returned by an IO operation
    OsError = 33,

    /// error occured while casting an integer to a smaller type, most likely
    /// means that the bitstream or the parameters contain invalid data
    IntegerCastOverflow = 1000,

    /// Caller passed in invalid command line parameters (only used by utility exe)
    SyntaxError = 1006,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ErrorCode {
    /// Converts the error code into an integer for use as a process exit code.
    pub fn as_integer_error_code(self) -> i32 {
        self as i32
    }

    /// Errors after which the caller may retry the same call once more
    /// input has been fed to the stream ring.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorCode::BitEmpty | ErrorCode::BitstreamStarved | ErrorCode::BitstreamWrap
        )
    }
}

/// Since errors are rare and stop everything, we want them to be as lightweight as possible.
#[derive(Debug, Clone)]
struct JpuErrorInternal {
    error_code: ErrorCode,
    message: String,
}

/// Standard error returned by the engine
#[derive(Debug, Clone)]
pub struct JpuError {
    i: Box<JpuErrorInternal>,
}

pub type Result<T> = std::result::Result<T, JpuError>;

impl Display for JpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{0}: {1}", self.i.error_code, self.i.message)
    }
}

impl JpuError {
    /// Creates a new JpuError with the specified error code and message.
    pub fn new(error_code: ErrorCode, message: impl AsRef<str>) -> JpuError {
        JpuError {
            i: Box::new(JpuErrorInternal {
                error_code,
                message: message.as_ref().to_owned(),
            }),
        }
    }

    /// Returns the error code to classify the error
    pub fn error_code(&self) -> ErrorCode {
        self.i.error_code
    }

    /// Returns the message of the error, which is a human-readable description of the error.
    pub fn message(&self) -> &str {
        &self.i.message
    }

    /// Adds context to the error by appending the current location in the code. This
    /// allows for building a callstack of where the error occurred.
    #[cold]
    #[inline(never)]
    #[track_caller]
    pub fn add_context(&mut self) {
        self.i
            .message
            .push_str(&format!("\n at {}", std::panic::Location::caller()));
    }
}

#[cold]
#[track_caller]
pub fn err_exit_code<T>(error_code: ErrorCode, message: impl AsRef<str>) -> Result<T> {
    let mut e = JpuError::new(error_code, message.as_ref());
    e.add_context();
    return Err(e);
}

pub trait AddContext<T> {
    #[track_caller]
    fn context(self) -> Result<T>;
}

impl<T, E: Into<JpuError>> AddContext<T> for core::result::Result<T, E> {
    #[track_caller]
    fn context(self) -> Result<T> {
        match self {
            Ok(x) => Ok(x),
            Err(e) => {
                let mut e = e.into();
                e.add_context();
                Err(e)
            }
        }
    }
}

impl std::error::Error for JpuError {}

fn get_io_error_code(e: &std::io::Error) -> ErrorCode {
    if e.kind() == ErrorKind::UnexpectedEof {
        ErrorCode::InsufficientBits
    } else {
        ErrorCode::OsError
    }
}

impl From<TryFromIntError> for JpuError {
    #[track_caller]
    fn from(e: TryFromIntError) -> Self {
        let mut e = JpuError::new(ErrorCode::IntegerCastOverflow, e.to_string());
        e.add_context();
        e
    }
}

/// translates std::io::Error into JpuError
impl From<std::io::Error> for JpuError {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        match e.downcast::<JpuError>() {
            Ok(je) => {
                return je;
            }
            Err(e) => {
                let mut e = JpuError::new(get_io_error_code(&e), e.to_string());
                e.add_context();
                e
            }
        }
    }
}

/// translates JpuError into std::io::Error, which involves putting into a Box and using Other
impl From<JpuError> for std::io::Error {
    fn from(e: JpuError) -> Self {
        return std::io::Error::new(std::io::ErrorKind::Other, e);
    }
}

#[test]
fn test_error_translation() {
    // test wrapping inside an io error
    fn my_std_error() -> core::result::Result<(), std::io::Error> {
        Err(JpuError::new(ErrorCode::WrongCallSequence, "test error").into())
    }

    let e: JpuError = my_std_error().unwrap_err().into();
    assert_eq!(e.error_code(), ErrorCode::WrongCallSequence);
    assert_eq!(e.message(), "test error");

    // an IO error should be translated into an OsError
    let e: JpuError = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found").into();
    assert_eq!(e.error_code(), ErrorCode::OsError);

    // running off the end of a cursor is a bit shortage
    let e: JpuError = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
    assert_eq!(e.error_code(), ErrorCode::InsufficientBits);
}

#[test]
fn test_context_appends_location() {
    fn fails() -> Result<()> {
        err_exit_code(ErrorCode::BitEmpty, "need more data")
    }

    let e = fails().context().unwrap_err();
    assert_eq!(e.error_code(), ErrorCode::BitEmpty);
    assert!(e.message().starts_with("need more data"));
    assert_eq!(e.message().matches("\n at ").count(), 2);
    assert!(e.error_code().is_recoverable());
}
