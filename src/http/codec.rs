//! The incremental HTTP/1.1 message parser/framer shared by the client and
//! server sides.
//!
//! Not grounded on the teacher's zero-copy `parser::h1::request::H1Request`
//! (its own `TODO` admits it assumes a whole message arrives in a single
//! read — it borrows `&'buf` slices straight out of one call's buffer).
//! Bytes here arrive a `read()` at a time off the reactor, so a message's
//! header block routinely straddles many calls to [`HttpMessageHandler::handle_input`].
//! What *is* kept from the teacher is the style: hand-rolled byte scanning
//! (no parser-combinator crate), one struct per error variety
//! (`super::error`), and RFC section citations on every rule lifted
//! straight from the governing subsection. `CodecObserver` plays the role
//! the teacher gives trait objects elsewhere (`TcpStream`, `TcpListener`,
//! `Connection`) rather than an inheritance hierarchy.

use super::error::{
    ChunkError, DuplicateCLError, ExtraDataError, HeaderSpaceError, HttpError, MalformedCLError,
    StartLineError, TooManyMsgsError, TopLineSpaceError,
};
use super::header::Headers;

/// Caps how many complete messages one `handle_input` call will parse out
/// of a single buffer before giving up — guards against a pipelining flood
/// driving unbounded work (and, since this codec parses iteratively rather
/// than by true recursion, unbounded latency) off one `read()`.
const MAX_PIPELINED_MESSAGES: usize = 64;

/// A chunk-size line longer than this without a terminating CRLF is
/// malformed rather than merely fragmented, per §4.6.5.
const MAX_CHUNK_SIZE_LINE: usize = 512;

/// The input side's state, per §4.6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputState {
    /// Expecting a start-line and header block (or a trailer block, while
    /// finishing a chunked body).
    Waiting,
    /// Header block parsed; consuming the body per the selected delimiter.
    HeadersDone,
    /// A fatal parse error occurred; all further input is discarded.
    Error,
    /// No input is legal right now (between client exchanges on a reused
    /// connection, waiting for the next request to be issued).
    Quiet,
}

/// How a message body is delimited, selected once per message per §4.6.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    /// No body is permitted at all (HEAD responses, 204/304, etc).
    NoBody,
    /// Exactly `n` bytes of body follow.
    Counted(usize),
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
    /// Body runs until the transport closes.
    Close,
    /// No delimiter has been selected yet (before the first message, or
    /// for an outbound message that hasn't called `output_start`).
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Accumulating a chunk-size line.
    Size,
    /// Consuming `left` more bytes of chunk data.
    InChunk { left: usize },
    /// A chunk's data is fully consumed; waiting for its trailing CRLF
    /// before the next chunk-size line. Exists separately from `Size` so
    /// the off-by-one cases in §4.6.5 (exactly `size` or `size+1` bytes
    /// having arrived) are handled by simply waiting here for more input
    /// rather than misreading a partial CRLF as the start of a size line.
    AwaitingChunkCrlf,
    /// Reading the trailer block after the zero-size chunk.
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    NoBody,
    Counted { left: usize },
    Close,
    Chunked(ChunkState),
}

/// The parsed head of one message: start line plus the header-derived
/// state §4.6.3 accumulates while scanning.
#[derive(Debug, Clone)]
pub struct ParsedHead {
    /// The raw start line (request line or status line), unparsed.
    pub top_line: Vec<u8>,
    /// Headers in the order received.
    pub headers: Headers,
    /// Lower-cased, comma-split `Connection` tokens.
    pub conn_tokens: Vec<String>,
    /// Lower-cased, comma-split `Transfer-Encoding` tokens.
    pub transfer_codes: Vec<String>,
    /// `Content-Length`, if present and not overridden by a
    /// `Transfer-Encoding`.
    pub content_length: Option<usize>,
}

/// The hook a client exchange or server exchange implements to receive
/// parsed message events and decide body framing, per §4.6.3's
/// `input_start` contract and §9's "codec as a subclass hook" design note.
pub trait CodecObserver {
    /// A start-line and header block have been fully parsed. Returns
    /// `(allows_body, is_final)`: whether this message carries a body at
    /// all (HEAD responses and 204/304 say no regardless of headers), and
    /// whether this is the final message of the exchange (`false` only for
    /// a 1xx interim response, which keeps the codec in `Waiting` for the
    /// real final response on the same connection).
    fn input_start(&mut self, head: &ParsedHead) -> (bool, bool);

    /// A chunk of body bytes has been delimited (never called for `NoBody`
    /// messages; called with everything at once for `Close`-delimited
    /// bodies as bytes arrive).
    fn input_body(&mut self, chunk: &[u8]);

    /// The body (if any) is complete, carrying any trailers a chunked body
    /// ended with.
    fn input_end(&mut self, trailers: Headers);

    /// Parsing hit an anomaly. `fatal` is `true` when the codec has already
    /// entered `Error` and discarded the rest of the input (the connection
    /// should be torn down, or answered with a synthesized error response,
    /// depending on `err.server_recoverable()`); `fatal` is `false` only for
    /// a `client_recoverable()` error tolerated because `careful=false`, in
    /// which case the codec keeps parsing the same message and the
    /// connection should just be marked non-reusable afterward.
    fn input_error(&mut self, err: Box<dyn HttpError>, fatal: bool);
}

/// Incremental HTTP/1.1 parser and framer. One instance per connection;
/// shared by both the client and server sides (see `super::client` and
/// `super::server`), which differ only in their [`CodecObserver`]
/// implementations and in which delimiter-selection table they apply.
pub struct HttpMessageHandler<O: CodecObserver> {
    observer: O,
    input_state: InputState,
    /// State re-entered after a body completes or `QUIET` ends.
    default_state: InputState,
    buf: Vec<u8>,
    body_state: BodyState,
    /// `Vec<u8>` accumulated in the `AwaitingChunkCrlf`/chunk-size/trailer
    /// sub-states, and for assembling the output buffer (`output_*`).
    out: Vec<u8>,
    /// §7's leniency switch: `true` means the first client-recoverable
    /// parsing anomaly is still fatal (the historical, strict behavior);
    /// `false` tolerates it, at the cost of the connection being marked
    /// non-reusable once the caller notices.
    careful: bool,
}

impl<O: CodecObserver> HttpMessageHandler<O> {
    /// Builds a handler in `Waiting` state, the shape every fresh
    /// connection starts in (§4.9). Pass `Quiet` as `default_state` for a
    /// client exchange's connection between its own requests.
    pub fn new(observer: O) -> Self {
        Self {
            observer,
            input_state: InputState::Waiting,
            default_state: InputState::Waiting,
            buf: Vec::new(),
            body_state: BodyState::Close,
            out: Vec::new(),
            careful: true,
        }
    }

    /// Sets §7's leniency switch. Client pools read this from
    /// `HttpClientConfig::careful`; the server side never calls it, so
    /// request parsing always stays strict.
    pub fn set_careful(&mut self, careful: bool) {
        self.careful = careful;
    }

    /// Access to the installed observer (for tests and for exchanges that
    /// need to reach through to their own state).
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Mutable access to the installed observer.
    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Switches between `Waiting` (server default; also a client expecting
    /// a response) and `Quiet` (client between requests on a reused
    /// connection) as the state resumed after each message completes.
    pub fn set_default_state_quiet(&mut self, quiet: bool) {
        self.default_state = if quiet { InputState::Quiet } else { InputState::Waiting };
        if self.input_state == InputState::Waiting || self.input_state == InputState::Quiet {
            self.input_state = self.default_state;
        }
    }

    /// Whether the codec has hit a fatal parse error and will discard all
    /// further input.
    pub fn is_errored(&self) -> bool {
        self.input_state == InputState::Error
    }

    /// Feeds newly-received bytes through the state machine, invoking
    /// `observer` callbacks for every event the new data completes.
    pub fn handle_input(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        let mut messages_this_call = 0usize;

        loop {
            match self.input_state {
                InputState::Error => {
                    self.buf.clear();
                    return;
                }
                InputState::Quiet => {
                    if self.buf.iter().any(|&b| !b.is_ascii_whitespace()) {
                        self.fail(ExtraDataError::new("data received while connection is quiet"));
                    }
                    self.buf.clear();
                    return;
                }
                InputState::Waiting => {
                    let Some((header_end, body_start)) = split_headers(&self.buf) else {
                        return;
                    };
                    messages_this_call += 1;
                    if messages_this_call > MAX_PIPELINED_MESSAGES {
                        self.fail(TooManyMsgsError::new(format!(
                            "more than {MAX_PIPELINED_MESSAGES} messages pipelined in one read"
                        )));
                        continue;
                    }
                    let header_block = self.buf[..header_end].to_vec();
                    self.buf.drain(..body_start);

                    match parse_head(&header_block, self.careful) {
                        Ok((head, tolerated)) => {
                            for err in tolerated {
                                self.observer.input_error(err, false);
                            }
                            let (allows_body, is_final) = self.observer.input_start(&head);
                            self.body_state = select_delimiter(allows_body, &head);
                            self.input_state = InputState::HeadersDone;
                            if !is_final {
                                // A 1xx interim response: its delimiter is always
                                // NoBody, and we stay ready for the real response.
                                self.finish_body(Headers::new());
                            }
                        }
                        Err(e) => self.fail_box(e),
                    }
                }
                InputState::HeadersDone => {
                    if self.buf.is_empty() {
                        return;
                    }
                    if !self.advance_body() {
                        return;
                    }
                }
            }
        }
    }

    fn fail(&mut self, err: impl HttpError + 'static) {
        self.fail_box(Box::new(err));
    }

    fn fail_box(&mut self, err: Box<dyn HttpError>) {
        self.input_state = InputState::Error;
        self.observer.input_error(err, true);
    }

    /// Drives the body sub-state machine against `self.buf`. Returns
    /// `true` if progress was made (so the outer loop should re-check for
    /// a fully-drained buffer / a new message starting), `false` if more
    /// input is required before anything further can happen.
    fn advance_body(&mut self) -> bool {
        match self.body_state {
            BodyState::NoBody => {
                self.finish_body(Headers::new());
                true
            }
            BodyState::Counted { left } => {
                let take = left.min(self.buf.len());
                if take > 0 {
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    self.observer.input_body(&chunk);
                }
                let left = left - take;
                if left == 0 {
                    self.finish_body(Headers::new());
                } else {
                    self.body_state = BodyState::Counted { left };
                }
                take > 0
            }
            BodyState::Close => {
                if self.buf.is_empty() {
                    return false;
                }
                let chunk = std::mem::take(&mut self.buf);
                self.observer.input_body(&chunk);
                true
            }
            BodyState::Chunked(sub) => self.advance_chunked(sub),
        }
    }

    fn advance_chunked(&mut self, sub: ChunkState) -> bool {
        match sub {
            ChunkState::Size => {
                let Some((line_end, next)) = find_line(&self.buf) else {
                    if self.buf.len() > MAX_CHUNK_SIZE_LINE {
                        self.fail(ChunkError::new("chunk size line exceeded 512 bytes without a CRLF"));
                    }
                    return false;
                };
                let line = self.buf[..line_end].to_vec();
                self.buf.drain(..next);
                let size_token = line.split(|&b| b == b';').next().unwrap_or(&line);
                let size_str = match std::str::from_utf8(size_token) {
                    Ok(s) => s.trim(),
                    Err(_) => {
                        self.fail(ChunkError::new("chunk size was not valid UTF-8"));
                        return true;
                    }
                };
                match usize::from_str_radix(size_str, 16) {
                    Ok(0) => {
                        self.body_state = BodyState::Chunked(ChunkState::Trailers);
                    }
                    Ok(n) => {
                        self.body_state = BodyState::Chunked(ChunkState::InChunk { left: n });
                    }
                    Err(_) => {
                        self.fail(ChunkError::new(format!("invalid chunk size {size_str:?}")));
                    }
                }
                true
            }
            ChunkState::InChunk { left } => {
                let take = left.min(self.buf.len());
                if take > 0 {
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    self.observer.input_body(&chunk);
                }
                let left = left - take;
                if left == 0 {
                    self.body_state = BodyState::Chunked(ChunkState::AwaitingChunkCrlf);
                } else {
                    self.body_state = BodyState::Chunked(ChunkState::InChunk { left });
                }
                take > 0
            }
            ChunkState::AwaitingChunkCrlf => {
                // Exactly the off-by-one cases §4.6.5 calls out: `size` or
                // `size+1` bytes may have arrived by the time we get here,
                // i.e. zero or one byte of the terminating CRLF. Wait for
                // both before consuming, rather than guessing from a
                // partial terminator.
                let Some((line_end, next)) = find_line(&self.buf) else {
                    return false;
                };
                if line_end != 0 {
                    self.fail(ChunkError::new("chunk data was not followed immediately by CRLF"));
                    return true;
                }
                self.buf.drain(..next);
                self.body_state = BodyState::Chunked(ChunkState::Size);
                true
            }
            ChunkState::Trailers => {
                let Some((header_end, body_start)) = find_blank_line_boundary(&self.buf, 0) else {
                    return false;
                };
                let block = self.buf[..header_end].to_vec();
                self.buf.drain(..body_start);
                if block.iter().all(|&b| b.is_ascii_whitespace()) {
                    self.finish_body(Headers::new());
                    return true;
                }
                match parse_fields(&block, self.careful) {
                    Ok((trailers, _conn, _te, _cl, tolerated)) => {
                        for err in tolerated {
                            self.observer.input_error(err, false);
                        }
                        self.finish_body(trailers);
                    }
                    Err(e) => self.fail_box(e),
                }
                true
            }
        }
    }

    fn finish_body(&mut self, trailers: Headers) {
        self.observer.input_end(trailers);
        self.body_state = BodyState::Close;
        self.input_state = self.default_state;
    }

    /// Writes a start line and header block to the internal output
    /// buffer, per §4.6.6. Headers are emitted exactly as given, in order,
    /// with no reordering or canonicalization.
    pub fn output_start(&mut self, top_line: &[u8], headers: &Headers, delimiter: Delimiter) {
        self.out.extend_from_slice(top_line);
        self.out.extend_from_slice(b"\r\n");
        for h in headers.iter() {
            self.out.extend_from_slice(&h.name);
            self.out.extend_from_slice(b": ");
            self.out.extend_from_slice(&h.value);
            self.out.extend_from_slice(b"\r\n");
        }
        self.out.extend_from_slice(b"\r\n");
        self.body_state = delimiter_to_output_body_state(delimiter);
    }

    /// Writes one body chunk to the output buffer, framing it per the
    /// delimiter passed to the most recent `output_start`. A no-op for
    /// empty `chunk` or a `NoBody`/`None` delimiter.
    pub fn output_body(&mut self, chunk: &[u8], delimiter: Delimiter) {
        if chunk.is_empty() || matches!(delimiter, Delimiter::NoBody | Delimiter::None) {
            return;
        }
        if delimiter == Delimiter::Chunked {
            self.out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            self.out.extend_from_slice(chunk);
            self.out.extend_from_slice(b"\r\n");
        } else {
            self.out.extend_from_slice(chunk);
        }
    }

    /// Finishes the current output message. Returns `true` if the
    /// transport must be closed afterward (`Close` or `None` delimiters
    /// have no other way to signal the end of the message).
    pub fn output_end(&mut self, trailers: &Headers, delimiter: Delimiter) -> bool {
        match delimiter {
            Delimiter::NoBody | Delimiter::Counted(_) => false,
            Delimiter::Chunked => {
                self.out.extend_from_slice(b"0\r\n");
                for h in trailers.iter() {
                    self.out.extend_from_slice(&h.name);
                    self.out.extend_from_slice(b": ");
                    self.out.extend_from_slice(&h.value);
                    self.out.extend_from_slice(b"\r\n");
                }
                self.out.extend_from_slice(b"\r\n");
                false
            }
            Delimiter::Close | Delimiter::None => true,
        }
    }

    /// Drains everything queued by `output_*` so it can be handed to the
    /// transport.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

fn delimiter_to_output_body_state(_delimiter: Delimiter) -> BodyState {
    // Output framing does not reuse the input body state machine directly
    // (it is driven by explicit `output_body` calls, not incoming bytes);
    // this resets any stale input-side state left over from the previous
    // message so a reused `HttpMessageHandler` starts its next input parse
    // clean.
    BodyState::Close
}

/// Chooses the body delimiter for a freshly-parsed message, per §4.6.4.
fn select_delimiter(allows_body: bool, head: &ParsedHead) -> BodyState {
    if !allows_body {
        return BodyState::NoBody;
    }
    if let Some(last) = head.transfer_codes.last() {
        return if last == "chunked" {
            BodyState::Chunked(ChunkState::Size)
        } else {
            BodyState::Close
        };
    }
    if let Some(n) = head.content_length {
        return BodyState::Counted { left: n };
    }
    BodyState::Close
}

/// Finds the next line terminator (`\n`, with an optional preceding `\r`
/// stripped), returning `(line_end_exclusive, next_line_start)`.
fn find_line(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.iter().position(|&b| b == b'\n')?;
    let line_end = if lf > 0 && buf[lf - 1] == b'\r' { lf - 1 } else { lf };
    Some((line_end, lf + 1))
}

fn line_at(buf: &[u8], pos: usize) -> Option<(usize, usize)> {
    if pos > buf.len() {
        return None;
    }
    let (end, next) = find_line(&buf[pos..])?;
    Some((pos + end, pos + next))
}

/// Finds the header/body boundary per §4.6.2: the first blank line, after
/// tolerating any number of leading blank lines and LF-only endings.
/// Returns `(header_block_end, body_start)`, both relative to the start of
/// `buf`; `header_block_end` includes any leading blank lines, which
/// `parse_head` skips in turn. `None` means the boundary hasn't arrived
/// yet.
fn split_headers(buf: &[u8]) -> Option<(usize, usize)> {
    let mut pos = 0usize;
    loop {
        let (line_end, next) = line_at(buf, pos)?;
        if line_end != pos {
            break;
        }
        pos = next;
    }
    find_blank_line_boundary(buf, pos)
}

/// Scans forward from `start` (no leading-blank-line tolerance) for the
/// first blank line, returning `(block_end, body_start)`. Used directly by
/// the chunked trailer state, which — unlike a message's primary header
/// block — has no start line and so no notion of "leading junk to skip";
/// an immediate blank line there means "zero trailers", not "keep
/// scanning".
fn find_blank_line_boundary(buf: &[u8], start: usize) -> Option<(usize, usize)> {
    let mut scan = start;
    loop {
        let (line_end, next) = line_at(buf, scan)?;
        if line_end == scan {
            return Some((scan, next));
        }
        scan = next;
    }
}

fn trim_ows(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

/// Parses a header block (start line + header lines) into its pieces, per
/// §4.6.3. Used for both a message's primary header block and a chunked
/// body's trailer block (which has no start line of its own — callers
/// parsing trailers should skip `top_line`).
fn parse_head(block: &[u8], careful: bool) -> Result<(ParsedHead, Vec<Box<dyn HttpError>>), Box<dyn HttpError>> {
    let mut pos = 0usize;
    let top_line = loop {
        let Some((line_end, next)) = line_at(block, pos) else {
            return Err(Box::new(StartLineError::new("missing start line")));
        };
        if line_end == pos {
            pos = next;
            continue;
        }
        let line = block[pos..line_end].to_vec();
        pos = next;
        break line;
    };

    let (headers, conn_tokens, transfer_codes, content_length, tolerated) = parse_fields(&block[pos..], careful)?;

    Ok((
        ParsedHead {
            top_line,
            headers,
            conn_tokens,
            transfer_codes,
            content_length,
        },
        tolerated,
    ))
}

type FieldsResult =
    Result<(Headers, Vec<String>, Vec<String>, Option<usize>, Vec<Box<dyn HttpError>>), Box<dyn HttpError>>;

/// Parses a header block with no leading start line (a chunked trailer
/// block, or the remainder of a primary header block after its start
/// line), per §4.6.3's per-line rules.
///
/// `careful` governs §7's leniency branch: a `TopLineSpaceError`,
/// `HeaderSpaceError`, or `DuplicateCLError` is fatal when `careful` is
/// `true`, but when it is `false` the anomaly is pushed onto the returned
/// list (to be reported via `input_error(_, false)`) and parsing carries
/// on, treating the offending line as best-effort valid input — matching
/// the grounded original's `careful` switch in `_parse_fields`.
fn parse_fields(block: &[u8], careful: bool) -> FieldsResult {
    let mut headers = Headers::new();
    let mut conn_tokens = Vec::new();
    let mut transfer_codes = Vec::new();
    let mut content_length: Option<usize> = None;
    let mut first_line = true;
    let mut pos = 0usize;
    let mut tolerated: Vec<Box<dyn HttpError>> = Vec::new();

    macro_rules! recoverable {
        ($err:expr) => {{
            let err: Box<dyn HttpError> = Box::new($err);
            if careful {
                return Err(err);
            }
            tolerated.push(err);
        }};
    }

    while let Some((line_end, next)) = line_at(block, pos) {
        if line_end == pos {
            pos = next;
            continue;
        }
        let line = &block[pos..line_end];
        pos = next;

        if matches!(line.first(), Some(b' ') | Some(b'\t')) {
            if first_line {
                recoverable!(TopLineSpaceError::new("obs-fold continuation on the first header line"));
            } else {
                match headers.last_mut() {
                    Some(h) => {
                        h.append_folded(trim_ows(line));
                        continue;
                    }
                    None => recoverable!(TopLineSpaceError::new("obs-fold continuation with no preceding header")),
                }
            }
            // Tolerated (careful=false): fall through and attempt to parse
            // this line as an ordinary header instead of an obs-fold.
        }
        first_line = false;

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue; // no colon: silently ignored, per §4.6.3
        };
        let name = &line[..colon];
        if matches!(name.last(), Some(b' ') | Some(b'\t')) {
            recoverable!(HeaderSpaceError::new(format!(
                "whitespace before colon in header name {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        // The stored value is the raw bytes after the colon, OWS included:
        // a header's value is whatever the wire said it was. `trimmed` is a
        // separate, local-only copy used to recognize Content-Length,
        // Connection, and Transfer-Encoding regardless of stray OWS.
        let raw_value = &line[colon + 1..];
        let trimmed = trim_ows(raw_value);

        if name.eq_ignore_ascii_case(b"Content-Length") {
            let n = parse_content_length(trimmed)?;
            match content_length {
                None => content_length = Some(n),
                Some(existing) if existing == n => {}
                Some(_) => {
                    recoverable!(DuplicateCLError::new("conflicting Content-Length values in the same message"));
                    // Tolerated: last-write-wins, matching the original's
                    // lenient re-assignment.
                    content_length = Some(n);
                }
            }
        } else if name.eq_ignore_ascii_case(b"Connection") {
            push_tokens(&mut conn_tokens, trimmed);
        } else if name.eq_ignore_ascii_case(b"Transfer-Encoding") {
            push_tokens(&mut transfer_codes, trimmed);
        }

        headers.push(name.to_vec().into_boxed_slice(), raw_value.to_vec().into_boxed_slice());
    }

    if !transfer_codes.is_empty() {
        // §4.6.3: "If both Transfer-Encoding and Content-Length are
        // present, Content-Length is ignored" for delimiter selection.
        content_length = None;
    }

    Ok((headers, conn_tokens, transfer_codes, content_length, tolerated))
}

fn parse_content_length(value: &[u8]) -> Result<usize, Box<dyn HttpError>> {
    let s = std::str::from_utf8(value)
        .map_err(|_| Box::new(MalformedCLError::new("Content-Length was not valid UTF-8")) as Box<dyn HttpError>)?;
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Box::new(MalformedCLError::new(format!("Content-Length {s:?} is not a non-negative integer"))));
    }
    s.parse::<usize>()
        .map_err(|_| Box::new(MalformedCLError::new(format!("Content-Length {s:?} out of range"))) as Box<dyn HttpError>)
}

fn push_tokens(out: &mut Vec<String>, value: &[u8]) {
    for raw in value.split(|&b| b == b',') {
        let t = trim_ows(raw);
        if t.is_empty() {
            continue;
        }
        out.push(String::from_utf8_lossy(t).to_ascii_lowercase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        starts: Vec<(Vec<u8>, bool, bool)>,
        body: Vec<u8>,
        ends: usize,
        errors: Vec<String>,
        fatal_errors: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct SharedRecorder(Rc<RefCell<Recorder>>);

    impl CodecObserver for SharedRecorder {
        fn input_start(&mut self, head: &ParsedHead) -> (bool, bool) {
            let allows_body = !head.top_line.starts_with(b"HEAD");
            let is_final = true;
            self.0.borrow_mut().starts.push((head.top_line.clone(), allows_body, is_final));
            (allows_body, is_final)
        }

        fn input_body(&mut self, chunk: &[u8]) {
            self.0.borrow_mut().body.extend_from_slice(chunk);
        }

        fn input_end(&mut self, _trailers: Headers) {
            self.0.borrow_mut().ends += 1;
        }

        fn input_error(&mut self, err: Box<dyn HttpError>, fatal: bool) {
            let mut r = self.0.borrow_mut();
            if fatal {
                r.fatal_errors.push(err.to_string());
            }
            r.errors.push(err.to_string());
        }
    }

    #[test]
    fn parses_a_counted_body_across_multiple_reads() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());

        handler.handle_input(b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhel");
        assert_eq!(rec.0.borrow().ends, 0);
        handler.handle_input(b"lo");

        let r = rec.0.borrow();
        assert_eq!(r.starts.len(), 1);
        assert_eq!(r.body, b"hello");
        assert_eq!(r.ends, 1);
        assert!(r.errors.is_empty());
    }

    #[test]
    fn tolerates_lf_only_line_endings_and_leading_blank_lines() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(b"\n\nGET / HTTP/1.1\nHost: a\n\n");
        let r = rec.0.borrow();
        assert_eq!(r.starts.len(), 1);
        assert_eq!(r.starts[0].0, b"GET / HTTP/1.1");
        assert_eq!(r.ends, 1);
    }

    #[test]
    fn obs_fold_appends_to_previous_header_with_single_space() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(b"GET / HTTP/1.1\r\nX-A: one\r\n two\r\nHost: a\r\n\r\n");
        let r = rec.0.borrow();
        assert_eq!(r.starts.len(), 1);
        assert!(r.errors.is_empty());
    }

    #[test]
    fn header_space_before_colon_is_rejected() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(b"GET / HTTP/1.1\r\nHost : a\r\n\r\n");
        assert_eq!(rec.0.borrow().errors.len(), 1);
    }

    #[test]
    fn duplicate_content_length_with_different_values_errors() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nx");
        assert_eq!(rec.0.borrow().errors.len(), 1);
    }

    #[test]
    fn duplicate_content_length_with_same_value_is_accepted() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 1\r\n\r\nx");
        let r = rec.0.borrow();
        assert!(r.errors.is_empty());
        assert_eq!(r.ends, 1);
    }

    #[test]
    fn transfer_encoding_overrides_content_length() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(
            b"POST / HTTP/1.1\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        let r = rec.0.borrow();
        assert!(r.errors.is_empty());
        assert_eq!(r.body, b"hello");
        assert_eq!(r.ends, 1);
    }

    #[test]
    fn chunked_body_split_across_reads_including_off_by_one_crlf() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel");
        handler.handle_input(b"lo"); // exactly `size` bytes arrived, no CRLF yet
        assert_eq!(rec.0.borrow().body, b"hello");
        handler.handle_input(b"\r"); // one byte of the trailing CRLF
        handler.handle_input(b"\n0\r\n\r\n");
        let r = rec.0.borrow();
        assert_eq!(r.body, b"hello");
        assert_eq!(r.ends, 1);
        assert!(r.errors.is_empty());
    }

    #[test]
    fn non_hex_chunk_size_is_a_chunk_error() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
        assert_eq!(rec.0.borrow().errors.len(), 1);
    }

    #[test]
    fn unknown_transfer_coding_closes_instead_of_erroring() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\nabc");
        let r = rec.0.borrow();
        assert!(r.errors.is_empty());
        assert_eq!(r.body, b"abc");
        assert_eq!(r.ends, 0, "a CLOSE-delimited body only ends when the transport closes");
    }

    #[test]
    fn extra_data_while_quiet_is_rejected() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.set_default_state_quiet(true);
        handler.handle_input(b"unexpected");
        assert_eq!(rec.0.borrow().errors.len(), 1);
    }

    #[test]
    fn output_framing_writes_status_line_headers_and_counted_body() {
        let handler_observer = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(handler_observer);
        let mut headers = Headers::new();
        headers.push(b"Content-Length".as_slice(), b"5".as_slice());
        handler.output_start(b"HTTP/1.1 200 OK", &headers, Delimiter::Counted(5));
        handler.output_body(b"hello", Delimiter::Counted(5));
        let must_close = handler.output_end(&Headers::new(), Delimiter::Counted(5));
        assert!(!must_close);
        assert_eq!(
            handler.take_output(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec()
        );
    }

    #[test]
    fn output_framing_chunked_body_emits_hex_sizes_and_terminator() {
        let handler_observer = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(handler_observer);
        handler.output_start(b"HTTP/1.1 200 OK", &Headers::new(), Delimiter::Chunked);
        handler.output_body(b"hello", Delimiter::Chunked);
        let must_close = handler.output_end(&Headers::new(), Delimiter::Chunked);
        assert!(!must_close);
        assert_eq!(
            handler.take_output(),
            b"HTTP/1.1 200 OK\r\n\r\n5\r\nhello\r\n0\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn output_close_delimiter_signals_must_close() {
        let handler_observer = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(handler_observer);
        handler.output_start(b"HTTP/1.0 200 OK", &Headers::new(), Delimiter::Close);
        handler.output_body(b"hi", Delimiter::Close);
        assert!(handler.output_end(&Headers::new(), Delimiter::Close));
    }

    #[test]
    fn header_value_ows_is_preserved_verbatim() {
        let (head, tolerated) = parse_head(b"GET / HTTP/1.1\r\nHost: a\r\nX-Foo:  bar \r\n\r\n", true).unwrap();
        assert!(tolerated.is_empty());
        assert_eq!(head.headers.get_first(b"X-Foo"), Some(b"  bar ".as_slice()));
    }

    #[test]
    fn chunked_trailer_ows_is_preserved_verbatim() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.handle_input(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\n12345\r\n0\r\nFoo: bar\r\nBaz: 1\r\n\r\n",
        );
        let r = rec.0.borrow();
        assert_eq!(r.body, b"12345");
        assert_eq!(r.ends, 1);
        assert!(r.errors.is_empty());

        let (_, trailers, _, _, tolerated) = parse_fields(b"Foo: bar\r\nBaz: 1\r\n", true).unwrap();
        assert!(tolerated.is_empty());
        assert_eq!(trailers.get_first(b"Foo"), Some(b" bar".as_slice()));
        assert_eq!(trailers.get_first(b"Baz"), Some(b" 1".as_slice()));
    }

    #[test]
    fn careful_aborts_on_header_space_before_colon() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.set_careful(true);
        handler.handle_input(b"GET / HTTP/1.1\r\nHost : a\r\n\r\n");
        let r = rec.0.borrow();
        assert_eq!(r.fatal_errors.len(), 1);
        assert!(handler.is_errored());
    }

    #[test]
    fn lenient_mode_tolerates_header_space_before_colon_and_keeps_parsing() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.set_careful(false);
        handler.handle_input(b"GET / HTTP/1.1\r\nHost : a\r\n\r\n");
        let r = rec.0.borrow();
        assert_eq!(r.errors.len(), 1, "the anomaly is still reported");
        assert!(r.fatal_errors.is_empty(), "but not as fatal");
        assert_eq!(r.starts.len(), 1, "parsing reached input_start anyway");
        assert_eq!(r.ends, 1);
        assert!(!handler.is_errored());
    }

    #[test]
    fn lenient_mode_keeps_the_newest_conflicting_content_length() {
        let rec = SharedRecorder::default();
        let mut handler = HttpMessageHandler::new(rec.clone());
        handler.set_careful(false);
        handler.handle_input(b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 5\r\n\r\nhello");
        let r = rec.0.borrow();
        assert_eq!(r.errors.len(), 1);
        assert!(r.fatal_errors.is_empty());
        assert_eq!(r.body, b"hello");
        assert_eq!(r.ends, 1);
    }
}
