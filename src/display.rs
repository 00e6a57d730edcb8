use std::io::{self, Read, Seek, SeekFrom};

use tracing::{debug, warn};

use crate::{
    data_file::DataFile,
    error::SinceError,
    mapping::{Access, Mapping},
    output::Output,
    signals::Shutdown,
};

/// Size of a single read or write
pub const IO_BUFFER: usize = 4096;

/// How far back an interrupted write looks for the start of the partial line
pub const LINE_SEARCH: usize = 160;

const SIZE_UNITS: [&str; 5] = ["b", "kb", "Mb", "Gb", "Tb"];

/// Whether processing may go on after a step
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// output was closed or termination was requested
    Interrupted,
}

/// Writes unread content of tracked files to an `Output`
pub struct Display<'a, O: Output> {
    output: &'a mut O,
    shutdown: &'a Shutdown,
    verbosity: u8,
    use_mmap: bool,
}

impl<'a, O: Output> Display<'a, O> {
    pub fn new(output: &'a mut O, shutdown: &'a Shutdown, verbosity: u8, use_mmap: bool) -> Self {
        Self {
            output,
            shutdown,
            verbosity,
            use_mmap,
        }
    }

    /// Display every file in order, stopping at the first interruption
    pub fn display_files(&mut self, files: &mut [DataFile]) -> Result<Flow, SinceError> {
        let single = files.len() == 1;
        for file in files.iter_mut() {
            if self.display_file(file, single)? == Flow::Interrupted {
                return Ok(Flow::Interrupted);
            }
        }
        Ok(Flow::Continue)
    }

    /// Mark everything currently in the files as seen, printing only headers
    pub fn discard_files(&mut self, files: &mut [DataFile]) -> Result<Flow, SinceError> {
        let single = files.len() == 1;
        for file in files.iter_mut() {
            if self.header(file, single, true)? == Flow::Interrupted {
                return Ok(Flow::Interrupted);
            }
            file.discard();
        }
        Ok(Flow::Continue)
    }

    pub fn display_file(
        &mut self,
        file: &mut DataFile,
        single: bool,
    ) -> Result<Flow, SinceError> {
        file.settle();

        let range = file.unread();
        if range == 0 {
            return self.header(file, single, false);
        }

        if self.use_mmap && range > IO_BUFFER as u64 {
            if let Some(mapping) = map_range(file, range) {
                if self.header(file, single, false)? == Flow::Interrupted {
                    return Ok(Flow::Interrupted);
                }
                let flow = self.write_recovering(file, &mapping);
                file.status.jump = true;
                return flow;
            }
        }

        if file.status.jump {
            file.file
                .seek(SeekFrom::Start(file.pos))
                .map_err(|source| display_error(file, source))?;
            file.status.jump = false;
        }

        if self.header(file, single, false)? == Flow::Interrupted {
            return Ok(Flow::Interrupted);
        }
        file.status.dirty = true;

        let mut buffer = vec![0; IO_BUFFER];
        while file.pos < file.now {
            let read = match file.file.read(&mut buffer) {
                Ok(0) => {
                    warn!(
                        file = %file.name.display(),
                        expected = file.now,
                        reached = file.pos,
                        "unexpected end of file"
                    );
                    file.now = file.pos;
                    break;
                }
                Ok(read) => read,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue
                }
                Err(source) => return Err(display_error(file, source)),
            };
            if self.write_recovering(file, &buffer[..read])? == Flow::Interrupted {
                return Ok(Flow::Interrupted);
            }
        }

        // the file may have grown while it was read
        if file.now < file.pos {
            file.now = file.pos;
        }

        Ok(Flow::Continue)
    }

    /// Send `buffer` to the output and advance the position of `file` by what was delivered.
    ///
    /// When the output breaks or termination is requested midway, the position only advances
    /// up to the last newline within `LINE_SEARCH` bytes before the interruption, so that the
    /// next run starts on a fresh line. Without such a newline the raw count is kept.
    fn write_recovering(
        &mut self,
        file: &mut DataFile,
        buffer: &[u8],
    ) -> Result<Flow, SinceError> {
        let mut written = 0;
        let mut interrupted = false;

        while written < buffer.len() {
            if self.shutdown.requested() {
                interrupted = true;
                break;
            }
            let end = buffer.len().min(written + IO_BUFFER);
            match self.output.write_data(&buffer[written..end]) {
                Ok(0) => {
                    return Err(display_error(file, io::ErrorKind::WriteZero.into()));
                }
                Ok(count) => written += count,
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    interrupted = true;
                    break;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) => {}
                Err(source) => return Err(display_error(file, source)),
            }
        }

        if !interrupted {
            file.advance(buffer.len() as u64);
            return Ok(Flow::Continue);
        }

        if written > 0 {
            let kept = line_boundary(&buffer[..written]);
            debug!(
                file = %file.name.display(),
                written,
                kept,
                "output interrupted"
            );
            file.advance(kept as u64);
        }
        Ok(Flow::Interrupted)
    }

    fn header(
        &mut self,
        file: &mut DataFile,
        single: bool,
        discarded: bool,
    ) -> Result<Flow, SinceError> {
        let wanted = match self.verbosity {
            0 => false,
            1 => !single && file.status.notable,
            2 => file.status.notable,
            _ => true,
        };
        if !wanted {
            return Ok(Flow::Continue);
        }
        file.status.notable = false;

        let line = format_header(file, discarded, self.verbosity);
        loop {
            match self.output.write_header(&line) {
                Ok(()) => return Ok(Flow::Continue),
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    return Ok(Flow::Interrupted)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if self.shutdown.requested() {
                        return Ok(Flow::Interrupted);
                    }
                }
                Err(source) => return Err(display_error(file, source)),
            }
        }
    }
}

fn display_error(file: &DataFile, source: io::Error) -> SinceError {
    SinceError::Display {
        path: file.name.clone(),
        source,
    }
}

fn map_range(file: &DataFile, range: u64) -> Option<Mapping> {
    let len = usize::try_from(range).ok()?;
    match Mapping::map(&file.file, file.pos, len, Access::ReadOnly) {
        Ok(mapping) => Some(mapping),
        Err(err) => {
            debug!(file = %file.name.display(), %err, "unable to map, falling back to read");
            None
        }
    }
}

/// Length of the prefix of `written` that ends on the last newline found within
/// `LINE_SEARCH` bytes of its end, or the whole length if there is none
pub fn line_boundary(written: &[u8]) -> usize {
    let back = written.len().saturating_sub(LINE_SEARCH);
    written[back..]
        .iter()
        .rposition(|&byte| byte == b'\n')
        .map(|index| back + index + 1)
        .unwrap_or(written.len())
}

/// Scale a byte count down by 1024 until it fits four digits or units run out
pub fn human_size(mut bytes: u64) -> (u64, &'static str) {
    let mut unit = 0;
    while unit + 1 < SIZE_UNITS.len() && bytes > 9999 {
        bytes /= 1024;
        unit += 1;
    }
    (bytes, SIZE_UNITS[unit])
}

fn format_header(file: &DataFile, discarded: bool, verbosity: u8) -> String {
    let mut line = format!("==> {} ", file.name.display());
    let mut nothing = true;

    if file.status.deleted {
        line.push_str("[deleted] ");
        nothing = false;
    } else if file.status.replaced {
        line.push_str("[replaced] ");
        nothing = false;
    } else if file.status.moved {
        line.push_str("[moved] ");
        nothing = false;
    }

    if file.pos != file.now {
        if discarded {
            line.push_str("[discarded] ");
        }
        if verbosity > 2 {
            let (value, unit) = human_size(file.unread());
            line.push_str(&format!("(+{value}{unit}) "));
        }
        nothing = false;
    }

    if nothing {
        line.push_str("[nothing new] ");
    }
    line.push_str("<==\n");
    line
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    /// Captures output, optionally breaking after `limit` data bytes
    #[derive(Default)]
    struct Capture {
        data: Vec<u8>,
        headers: Vec<String>,
        limit: Option<usize>,
        per_call: Option<usize>,
        raise_after_first: Option<Shutdown>,
    }

    impl Output for Capture {
        fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut count = buf.len();
            if let Some(per_call) = self.per_call {
                count = count.min(per_call);
            }
            if let Some(limit) = self.limit {
                let left = limit - self.data.len();
                if left == 0 {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
                count = count.min(left);
            }
            self.data.extend_from_slice(&buf[..count]);
            if let Some(shutdown) = self.raise_after_first.take() {
                shutdown.request();
            }
            Ok(count)
        }

        fn write_header(&mut self, line: &str) -> io::Result<()> {
            self.headers.push(line.to_string());
            Ok(())
        }
    }

    struct Scratch {
        dir: TempDir,
    }

    impl Scratch {
        fn file(&self, name: &str, content: &[u8]) -> DataFile {
            let path: PathBuf = self.dir.path().join(name);
            fs::write(&path, content).unwrap();
            DataFile::open(path).unwrap()
        }
    }

    #[fixture]
    fn scratch() -> Scratch {
        Scratch {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    #[rstest]
    #[case(b"hello\nworld", 6)]
    #[case(b"no newline at all", 17)]
    #[case(b"ends on newline\n", 16)]
    #[case(b"", 0)]
    fn boundary_is_last_newline(#[case] written: &[u8], #[case] expected: usize) {
        assert_eq!(line_boundary(written), expected);
    }

    #[test]
    fn boundary_search_is_bounded() {
        let mut written = b"early\n".to_vec();
        written.extend(std::iter::repeat(b'x').take(LINE_SEARCH));
        assert_eq!(line_boundary(&written), written.len());

        let mut written = b"early\n".to_vec();
        written.extend(std::iter::repeat(b'x').take(LINE_SEARCH - 1));
        assert_eq!(line_boundary(&written), 6);
    }

    #[rstest]
    #[case(0, (0, "b"))]
    #[case(9999, (9999, "b"))]
    #[case(10_000, (9, "kb"))]
    #[case(10 * 1024 * 1024, (10, "Mb"))]
    #[case(u64::MAX, (16_777_215, "Tb"))]
    fn sizes_use_binary_units(#[case] bytes: u64, #[case] expected: (u64, &'static str)) {
        assert_eq!(human_size(bytes), expected);
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn unread_content_is_displayed(scratch: Scratch, #[case] use_mmap: bool) {
        let content: Vec<u8> = (0..3 * IO_BUFFER + 17).map(|i| b'a' + (i % 26) as u8).collect();
        let mut files = vec![scratch.file("big", &content)];
        files[0].pos = 100;
        files[0].status.jump = true;
        let shutdown = Shutdown::new();
        let mut capture = Capture::default();

        let flow = Display::new(&mut capture, &shutdown, 1, use_mmap)
            .display_files(&mut files)
            .unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(capture.data, &content[100..]);
        assert_eq!(files[0].position(), content.len() as u64);
        assert!(files[0].status().dirty);
    }

    #[rstest]
    fn interrupted_write_keeps_partial_line(scratch: Scratch) {
        let mut files = vec![scratch.file("log", b"hello\nworld, and then some more\n")];
        let shutdown = Shutdown::new();
        let mut capture = Capture {
            limit: Some(11),
            ..Capture::default()
        };

        let flow = Display::new(&mut capture, &shutdown, 1, false)
            .display_files(&mut files)
            .unwrap();

        assert_eq!(flow, Flow::Interrupted);
        assert_eq!(capture.data, b"hello\nworld");
        assert_eq!(files[0].position(), 6);
        assert!(files[0].status().dirty);
    }

    #[rstest]
    fn termination_request_stops_between_writes(scratch: Scratch) {
        let mut files = vec![
            scratch.file("first", b"hello\nworld, and then some more\n"),
            scratch.file("second", b"never shown\n"),
        ];
        let shutdown = Shutdown::new();
        let mut capture = Capture {
            per_call: Some(11),
            raise_after_first: Some(shutdown.clone()),
            ..Capture::default()
        };

        let flow = Display::new(&mut capture, &shutdown, 0, false)
            .display_files(&mut files)
            .unwrap();

        assert_eq!(flow, Flow::Interrupted);
        assert_eq!(files[0].position(), 6);
        assert_eq!(files[1].position(), 0);
        assert!(!files[1].status().dirty);
    }

    #[rstest]
    fn broken_output_before_any_byte_changes_nothing(scratch: Scratch) {
        let mut files = vec![scratch.file("log", b"content\n")];
        let shutdown = Shutdown::new();
        let mut capture = Capture {
            limit: Some(0),
            ..Capture::default()
        };

        let flow = Display::new(&mut capture, &shutdown, 0, false)
            .display_files(&mut files)
            .unwrap();

        assert_eq!(flow, Flow::Interrupted);
        assert_eq!(files[0].position(), 0);
    }

    #[rstest]
    fn nothing_new_header(scratch: Scratch) {
        let mut files = vec![scratch.file("a", b"abc"), scratch.file("b", b"")];
        files[0].pos = 3;
        let shutdown = Shutdown::new();
        let mut capture = Capture::default();

        Display::new(&mut capture, &shutdown, 1, true)
            .display_files(&mut files)
            .unwrap();

        let a = scratch.dir.path().join("a");
        let b = scratch.dir.path().join("b");
        assert_eq!(
            capture.headers,
            vec![
                format!("==> {} [nothing new] <==\n", a.display()),
                format!("==> {} [nothing new] <==\n", b.display()),
            ]
        );
        assert!(capture.data.is_empty());
    }

    #[rstest]
    #[case(0, false, 0)]
    #[case(1, true, 0)]
    #[case(1, false, 1)]
    #[case(2, true, 1)]
    #[case(3, true, 2)]
    fn header_tiers(
        scratch: Scratch,
        #[case] verbosity: u8,
        #[case] single: bool,
        #[case] expected: usize,
    ) {
        let mut file = scratch.file("a", b"line\n");
        let shutdown = Shutdown::new();
        let mut capture = Capture::default();
        let mut display = Display::new(&mut capture, &shutdown, verbosity, false);

        display.display_file(&mut file, single).unwrap();
        display.display_file(&mut file, single).unwrap();

        assert_eq!(capture.headers.len(), expected);
    }

    #[rstest]
    fn verbose_header_shows_size(scratch: Scratch) {
        let mut files = vec![scratch.file("a", &[b'x'; 20_000])];
        let shutdown = Shutdown::new();
        let mut capture = Capture::default();

        Display::new(&mut capture, &shutdown, 3, false)
            .display_files(&mut files)
            .unwrap();

        let a = scratch.dir.path().join("a");
        assert_eq!(capture.headers, vec![format!("==> {} (+19kb) <==\n", a.display())]);
    }

    #[rstest]
    fn discard_skips_content(scratch: Scratch) {
        let mut files = vec![scratch.file("a", b"old stuff\n"), scratch.file("b", b"")];
        let shutdown = Shutdown::new();
        let mut capture = Capture::default();

        Display::new(&mut capture, &shutdown, 1, true)
            .discard_files(&mut files)
            .unwrap();

        let a = scratch.dir.path().join("a");
        assert!(capture.data.is_empty());
        assert_eq!(capture.headers[0], format!("==> {} [discarded] <==\n", a.display()));
        assert_eq!(files[0].position(), 10);
        assert!(files[0].status().dirty);
        assert!(!files[1].status().dirty);
    }

    #[rstest]
    fn deleted_file_is_annotated(scratch: Scratch) {
        let mut file = scratch.file("a", b"abc");
        file.pos = 3;
        fs::remove_file(scratch.dir.path().join("a")).unwrap();
        file.refresh().unwrap();
        let shutdown = Shutdown::new();
        let mut capture = Capture::default();

        Display::new(&mut capture, &shutdown, 2, false)
            .display_file(&mut file, true)
            .unwrap();

        let a = scratch.dir.path().join("a");
        assert_eq!(capture.headers, vec![format!("==> {} [deleted] <==\n", a.display())]);
    }
}
