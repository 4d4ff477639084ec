use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use evhttp::http::codec::{CodecObserver, Delimiter, HttpMessageHandler, ParsedHead};
use evhttp::http::error::HttpError;
use evhttp::http::header::Headers;

const REQ: &[u8] = b"\
GET /api/v1.0/weather/forecast HTTP/1.1\r\n\
Host: www.example.org\r\n\r\n";

const REQ_MED: &[u8] = b"\
GET /api/v1.0/weather/forecast HTTP/1.1\r\n\
Accept:*/*\r\n\
Accept-Encoding:gzip,deflate,br\r\n\
Accept-Language:en-US,en;q=0.5\r\n\
Cache-Control:no-cache\r\n\
Connection:keep-alive\r\n\
DNT:1\r\n\
Host: www.example.org\r\n\
Pragma:no-cache\r\n\
Referrer:https://www.example.org\r\n\
Sec-Fetch-Dest:empty\r\n\
Sec-Fetch-Mode:cors\r\n\
Sec-Fetch-Site:same-origin\r\n\
User-Agent:Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/109.0\r\n\r\n";

const REQ_CHUNKED: &[u8] = b"\
POST /upload HTTP/1.1\r\n\
Host: www.example.org\r\n\
Transfer-Encoding: chunked\r\n\r\n\
1a\r\n\
abcdefghijklmnopqrstuvwxyz\r\n\
a\r\n\
0123456789\r\n\
0\r\n\r\n";

const REQ_COMP: &[u8] = b"\
GET /wp-content/uploads/2010/03/darth-vader-jedi-battle-lightsaber.jpg HTTP/1.1\r\n\
Host: www.example.org\r\n\
User-Agent: Mozilla/5.0 (Macintosh; U; Intel Mac OS X 10.6; ja-JP-mac; rv:1.9.2.3) Gecko/20100401 Firefox/3.6.3 Pathtraq/0.9\r\n\
Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
Accept-Language: ja,en-us;q=0.7,en;q=0.3\r\n\
Accept-Encoding: gzip,deflate\r\n\
Accept-Charset: Shift_JIS,utf-8;q=0.7,*;q=0.7\r\n\
Keep-Alive: 115\r\n\
Connection: keep-alive\r\n\
Cookie: wp_ozh_wsa_visits=2; wp_ozh_wsa_visit_lasttime=xxxxxxxxxx\r\n\r\n";

struct NullObserver;

impl CodecObserver for NullObserver {
    fn input_start(&mut self, _head: &ParsedHead) -> (bool, bool) {
        (true, true)
    }
    fn input_body(&mut self, _chunk: &[u8]) {}
    fn input_end(&mut self, _trailers: Headers) {}
    fn input_error(&mut self, _err: Box<dyn HttpError>, _fatal: bool) {}
}

fn parse_benchmark(c: &mut Criterion) {
    let inputs = [REQ, REQ_MED, REQ_COMP, REQ_CHUNKED];

    let mut group = c.benchmark_group("codec_parse");
    for &input in inputs.iter() {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("handle_input", input.len() as u64), input, |b, i| {
            b.iter(|| {
                let mut codec = HttpMessageHandler::new(NullObserver);
                codec.handle_input(i);
            })
        });
    }
    group.finish();
}

fn frame_benchmark(c: &mut Criterion) {
    let headers = {
        let mut h = Headers::new();
        h.push(b"Content-Type".as_slice(), b"text/plain".as_slice());
        h
    };
    let body = vec![b'x'; 4096];

    let mut group = c.benchmark_group("codec_frame");
    group.throughput(Throughput::Bytes(body.len() as u64));
    group.bench_function("output_counted", |b| {
        b.iter(|| {
            let mut codec = HttpMessageHandler::new(NullObserver);
            codec.output_start(b"HTTP/1.1 200 OK", &headers, Delimiter::Counted(body.len()));
            codec.output_body(&body, Delimiter::Counted(body.len()));
            codec.output_end(&Headers::new(), Delimiter::Counted(body.len()));
            codec.take_output()
        })
    });
    group.bench_function("output_chunked", |b| {
        b.iter(|| {
            let mut codec = HttpMessageHandler::new(NullObserver);
            codec.output_start(b"HTTP/1.1 200 OK", &headers, Delimiter::Chunked);
            codec.output_body(&body, Delimiter::Chunked);
            codec.output_end(&Headers::new(), Delimiter::Chunked);
            codec.take_output()
        })
    });
    group.finish();
}

criterion_group!(benches, parse_benchmark, frame_benchmark);
criterion_main!(benches);
