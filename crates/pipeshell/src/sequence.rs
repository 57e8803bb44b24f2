//! Output sequences of in-process stages
//!
//! A function stage produces a `Sequence`: a local stream of fallible
//! chunks. `Ok(None)` is a tick that yields control to the event loop
//! without emitting data. An `Err` ends the stage and marks it failed.

use std::future::Future;

use futures::stream;
use futures::stream::LocalBoxStream;
use futures::Stream;
use futures::StreamExt;

/// One item of a sequence. `None` is a tick.
pub type Chunk = Option<Vec<u8>>;

/// Lazy output of a function stage.
pub type Sequence = LocalBoxStream<'static, anyhow::Result<Chunk>>;

/// Values that can be emitted by a function stage.
pub trait IntoChunk {
    fn into_chunk(self) -> Chunk;
}

impl IntoChunk for String {
    fn into_chunk(self) -> Chunk {
        Some(self.into_bytes())
    }
}

impl IntoChunk for &str {
    fn into_chunk(self) -> Chunk {
        Some(self.as_bytes().to_vec())
    }
}

impl IntoChunk for Vec<u8> {
    fn into_chunk(self) -> Chunk {
        Some(self)
    }
}

impl IntoChunk for &[u8] {
    fn into_chunk(self) -> Chunk {
        Some(self.to_vec())
    }
}

impl<T: IntoChunk> IntoChunk for Option<T> {
    fn into_chunk(self) -> Chunk {
        self.and_then(IntoChunk::into_chunk)
    }
}

macro_rules! impl_into_chunk_display {
    ($($ty:ty),*) => {
        $(
            impl IntoChunk for $ty {
                fn into_chunk(self) -> Chunk {
                    Some(self.to_string().into_bytes())
                }
            }
        )*
    };
}

impl_into_chunk_display!(i32, i64, u32, u64, usize, f64, bool, char);

/// Sequence over a plain iterator.
pub fn from_iter<I>(items: I) -> Sequence
where
    I: IntoIterator + 'static,
    I::Item: IntoChunk,
{
    stream::iter(items.into_iter().map(|item| Ok(item.into_chunk()))).boxed_local()
}

/// Sequence over an iterator of results. The first error ends the sequence.
pub fn try_from_iter<I, T, E>(items: I) -> Sequence
where
    I: IntoIterator<Item = Result<T, E>> + 'static,
    T: IntoChunk,
    E: Into<anyhow::Error>,
{
    stream::iter(
        items
            .into_iter()
            .map(|item| item.map(IntoChunk::into_chunk).map_err(Into::into)),
    )
    .boxed_local()
}

/// Sequence over an async stream.
pub fn from_stream<S>(items: S) -> Sequence
where
    S: Stream + 'static,
    S::Item: IntoChunk,
{
    items.map(|item| Ok(item.into_chunk())).boxed_local()
}

/// Sequence over an async stream of results.
pub fn try_from_stream<S, T, E>(items: S) -> Sequence
where
    S: Stream<Item = Result<T, E>> + 'static,
    T: IntoChunk,
    E: Into<anyhow::Error>,
{
    items
        .map(|item| item.map(IntoChunk::into_chunk).map_err(Into::into))
        .boxed_local()
}

/// Sequence of exactly one item.
pub fn from_value<T: IntoChunk + 'static>(value: T) -> Sequence {
    stream::once(async move { Ok(value.into_chunk()) }).boxed_local()
}

/// Sequence of the single value a future resolves to.
pub fn from_future<F, T>(future: F) -> Sequence
where
    F: Future<Output = anyhow::Result<T>> + 'static,
    T: IntoChunk,
{
    stream::once(async move { future.await.map(IntoChunk::into_chunk) }).boxed_local()
}

pub fn empty() -> Sequence {
    stream::empty().boxed_local()
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;

    fn collect(seq: Sequence) -> Vec<anyhow::Result<Chunk>> {
        block_on(seq.collect::<Vec<_>>())
    }

    #[test]
    fn test_from_iter_mixed_ticks() {
        let items = collect(from_iter(vec![Some("a"), None, Some("b")]));
        let chunks: Vec<Chunk> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks, vec![Some(b"a".to_vec()), None, Some(b"b".to_vec())]);
    }

    #[test]
    fn test_try_from_iter_stops_at_error() {
        let items: Vec<Result<&str, std::io::Error>> =
            vec![Ok("x"), Err(std::io::Error::other("boom"))];
        let out = collect(try_from_iter(items));
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert_eq!(out[1].as_ref().unwrap_err().to_string(), "boom");
    }

    #[test]
    fn test_numbers_render_as_text() {
        let out = collect(from_iter(1..=3));
        let texts: Vec<String> = out
            .into_iter()
            .map(|r| String::from_utf8(r.unwrap().unwrap()).unwrap())
            .collect();
        assert_eq!(texts, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_from_future_and_value() {
        let out = collect(from_future(async { Ok::<_, anyhow::Error>("done") }));
        assert_eq!(out[0].as_ref().unwrap(), &Some(b"done".to_vec()));

        let out = collect(from_value(String::from("v")));
        assert_eq!(out.len(), 1);
        assert!(collect(empty()).is_empty());
    }
}
