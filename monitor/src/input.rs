//! Where input answers come from: the interactive terminal, an input file
//! that ends the session at EOF, or an init script that hands over to the
//! terminal once it runs out.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

pub enum InputSource {
    Stdin,
    Script {
        reader: BufReader<File>,
        /// Fall back to stdin at EOF instead of ending the session.
        then_stdin: bool,
    },
}

impl InputSource {
    pub fn stdin() -> Self {
        InputSource::Stdin
    }

    pub fn from_file(path: &Path, then_stdin: bool) -> io::Result<Self> {
        Ok(InputSource::Script {
            reader: BufReader::new(File::open(path)?),
            then_stdin,
        })
    }

    /// Fetches the next chunk to feed the firmware: a line in line mode (or
    /// from any file source), a single byte otherwise. `None` means the
    /// source is exhausted and the session should wind down.
    pub fn next_chunk(&mut self, line_mode: bool) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self {
                InputSource::Script { reader, then_stdin } => {
                    let mut line = String::new();
                    if reader.read_line(&mut line)? > 0 {
                        return Ok(Some(line.into_bytes()));
                    }
                    if !*then_stdin {
                        return Ok(None);
                    }
                    log::info!("init script completed, switching to stdin");
                    *self = InputSource::Stdin;
                }
                InputSource::Stdin if line_mode => {
                    let mut line = String::new();
                    if io::stdin().lock().read_line(&mut line)? == 0 {
                        log::info!("stdin reached EOF");
                        return Ok(None);
                    }
                    return Ok(Some(line.into_bytes()));
                }
                InputSource::Stdin => {
                    let mut byte = [0u8; 1];
                    if io::stdin().lock().read(&mut byte)? == 0 {
                        log::info!("stdin reached EOF");
                        return Ok(None);
                    }
                    return Ok(Some(byte.to_vec()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn input_file_yields_lines_then_ends() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first").unwrap();
        writeln!(file, "second").unwrap();
        file.flush().unwrap();

        let mut source = InputSource::from_file(file.path(), false).unwrap();
        assert_eq!(source.next_chunk(true).unwrap(), Some(b"first\n".to_vec()));
        assert_eq!(source.next_chunk(false).unwrap(), Some(b"second\n".to_vec()));
        assert_eq!(source.next_chunk(true).unwrap(), None);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(InputSource::from_file(Path::new("/nonexistent/script"), true).is_err());
    }
}
