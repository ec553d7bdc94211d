//! Compiling Python source to bytecode
//!
//! Bytecode must come from the same interpreter the bundle runs on, so the
//! default [`SourceCompiler`] keeps one interpreter process alive and feeds it
//! sources over a pipe.

use std::{
    io::{BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use log::debug;
use thiserror::Error;

use crate::request::OptimizeLevel;

/// Why a source could not be compiled
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("line {line}: {message}")]
    Syntax { message: String, line: usize },
    #[error("{0}")]
    Backend(String),
}

/// Turns source text into a marshalled code object
pub trait SourceCompiler {
    /// `filename` is embedded in the code object and shown in tracebacks
    fn compile(
        &mut self,
        source: &[u8],
        filename: &str,
        optimize: OptimizeLevel,
    ) -> Result<Vec<u8>, CompileError>;
}

const COMPILE_SERVER: &str = r#"
import marshal, sys
stdin, stdout = sys.stdin.buffer, sys.stdout.buffer
while True:
    header = stdin.readline()
    if not header:
        break
    name_len, source_len, optimize = map(int, header.split())
    name = stdin.read(name_len).decode("utf-8", "surrogateescape")
    source = stdin.read(source_len)
    try:
        code = compile(source, name, "exec", dont_inherit=True, optimize=optimize)
    except SyntaxError as e:
        message = (e.msg or "invalid syntax").encode("utf-8", "replace")
        stdout.write(b"ERR %d %d\n" % (len(message), e.lineno or 0))
        stdout.write(message)
    except (ValueError, TypeError) as e:
        message = str(e).encode("utf-8", "replace")
        stdout.write(b"ERR %d 0\n" % len(message))
        stdout.write(message)
    else:
        data = marshal.dumps(code)
        stdout.write(b"OK %d\n" % len(data))
        stdout.write(data)
    stdout.flush()
"#;

#[derive(Debug)]
struct CompileServer {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// Compiles with a persistent interpreter subprocess
#[derive(Debug)]
pub struct PythonCompiler {
    python: PathBuf,
    server: Option<CompileServer>,
}

impl PythonCompiler {
    /// The process is started on first use
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            server: None,
        }
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    fn server(&mut self) -> Result<&mut CompileServer, CompileError> {
        if self.server.is_none() {
            debug!("Starting bytecode compiler {}", self.python.display());
            let mut child = Command::new(&self.python)
                .args(["-c", COMPILE_SERVER])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| {
                    CompileError::Backend(format!(
                        "cannot start {}: {e}",
                        self.python.display()
                    ))
                })?;
            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                return Err(CompileError::Backend(
                    "compiler process has no pipes".to_owned(),
                ));
            };
            self.server = Some(CompileServer {
                child,
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
            });
        }
        self.server
            .as_mut()
            .ok_or_else(|| CompileError::Backend("compiler process not running".to_owned()))
    }
}

impl CompileServer {
    fn request(
        &mut self,
        source: &[u8],
        filename: &str,
        optimize: OptimizeLevel,
    ) -> std::io::Result<Result<Vec<u8>, CompileError>> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "compiler stdin closed")
        })?;
        writeln!(
            stdin,
            "{} {} {}",
            filename.len(),
            source.len(),
            optimize.as_u8()
        )?;
        stdin.write_all(filename.as_bytes())?;
        stdin.write_all(source)?;
        stdin.flush()?;

        let mut header = String::new();
        if self.stdout.read_line(&mut header)? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "compiler process exited",
            ));
        }
        let fields: Vec<&str> = header.split_whitespace().collect();
        let parse = |field: Option<&&str>| -> std::io::Result<usize> {
            field
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed compiler reply '{}'", header.trim()),
                    )
                })
        };
        let length = parse(fields.get(1))?;
        let mut payload = vec![0; length];
        self.stdout.read_exact(&mut payload)?;

        match fields.first() {
            Some(&"OK") => Ok(Ok(payload)),
            Some(&"ERR") => Ok(Err(CompileError::Syntax {
                message: String::from_utf8_lossy(&payload).into_owned(),
                line: parse(fields.get(2))?,
            })),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown compiler reply '{}'", header.trim()),
            )),
        }
    }
}

impl SourceCompiler for PythonCompiler {
    fn compile(
        &mut self,
        source: &[u8],
        filename: &str,
        optimize: OptimizeLevel,
    ) -> Result<Vec<u8>, CompileError> {
        let server = self.server()?;
        match server.request(source, filename, optimize) {
            Ok(result) => result,
            Err(e) => {
                // A broken pipe leaves the protocol out of sync; restart next time
                self.server = None;
                Err(CompileError::Backend(e.to_string()))
            }
        }
    }
}

impl Drop for CompileServer {
    fn drop(&mut self) {
        // Closing stdin ends the server loop
        drop(self.stdin.take());
        if let Err(e) = self.child.wait() {
            debug!("Bytecode compiler did not exit cleanly: {e}");
        }
    }
}

/// Prefix marshalled code with the 16-byte header the runtime expects:
/// magic number, flags (0: timestamp based), source mtime and source size
pub fn pyc_bytes(magic: [u8; 4], code: &[u8], mtime: u32, source_size: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16 + code.len());
    bytes.extend_from_slice(&magic);
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&mtime.to_le_bytes());
    bytes.extend_from_slice(&source_size.to_le_bytes());
    bytes.extend_from_slice(code);
    bytes
}
