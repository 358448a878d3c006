//! SSE 数据行解析
//!
//! 网络读取的边界可能落在多字节字符中间，这里按字节缓冲，只解码完整的行。

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use tracing::debug;

use super::types::LlmError;

/// 按字节累积的行缓冲
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 取出下一条完整的行（去掉首尾空白）
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        let line = match String::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => {
                debug!("SSE line is not valid UTF-8: {}", e);
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        Some(line.trim().to_string())
    }
}

/// 将响应字节流转换为 `data:` 负载流，遇到 `[DONE]` 结束
pub fn data_payloads<S, B, E>(stream: S) -> impl Stream<Item = Result<String, LlmError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Into<LlmError> + Send,
{
    try_stream! {
        let mut lines = LineBuffer::default();
        futures::pin_mut!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk: Result<B, LlmError> = chunk.map_err(Into::into);
            lines.push(chunk?.as_ref());

            while let Some(line) = lines.next_line() {
                if let Some(data) = line.strip_prefix("data:") {
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }
                    yield data.to_string();
                }
            }
        }
    }
}

/// 在 `split` 字节处切开响应体，模拟两次网络读取
#[cfg(test)]
pub(crate) fn split_body(body: &str, split: usize) -> Vec<Result<Vec<u8>, LlmError>> {
    let bytes = body.as_bytes();
    vec![Ok(bytes[..split].to_vec()), Ok(bytes[split..].to_vec())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_buffer_waits_for_complete_character() {
        let line = "data: 文档\n";
        let split = line.find('文').unwrap() + 1;

        let mut buffer = LineBuffer::default();
        buffer.push(&line.as_bytes()[..split]);
        assert_eq!(buffer.next_line(), None);

        buffer.push(&line.as_bytes()[split..]);
        assert_eq!(buffer.next_line().as_deref(), Some("data: 文档"));
        assert_eq!(buffer.next_line(), None);
    }

    #[tokio::test]
    async fn test_payloads_survive_split_reads() {
        let body = "event: x\ndata: {\"text\":\"文档\"}\n\n: keep-alive\ndata: [DONE]\ndata: ignored\n";
        let split = body.find('文').unwrap() + 1;

        let payloads: Vec<String> = data_payloads(futures::stream::iter(split_body(body, split)))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(payloads, vec![r#"{"text":"文档"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let chunks: Vec<Result<Vec<u8>, LlmError>> = vec![
            Ok(b"data: one\n".to_vec()),
            Err(LlmError::StreamError("reset".to_string())),
        ];
        let results: Vec<Result<String, LlmError>> =
            data_payloads(futures::stream::iter(chunks)).collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_deref().unwrap(), "one");
        assert!(matches!(results[1], Err(LlmError::StreamError(_))));
    }
}
