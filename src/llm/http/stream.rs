use serde_json::Value;

use crate::error::LlmError;

#[derive(Clone, Debug, PartialEq)]
pub enum SseEvent {
    Data(Value),
    Done,
}

/// SSE (Server-Sent Events) 解析器
///
/// 用于解析流式响应中的 SSE 格式数据
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// 解析数据块，返回完整的事件列表；不完整的尾部留在 buffer 中
    ///
    /// SSE 格式：
    /// ```text
    /// data: {"id":"...","choices":[{"delta":{"content":"Hello"}}]}
    ///
    /// data: [DONE]
    /// ```
    pub fn parse_chunk(&mut self, data: &[u8]) -> Result<Vec<SseEvent>, LlmError> {
        let text = String::from_utf8_lossy(data);
        self.buffer.push_str(&text.replace("\r\n", "\n"));

        let mut events = Vec::new();
        let mut processed = 0;

        while let Some(end_pos) = self.buffer[processed..].find("\n\n") {
            let event_end = processed + end_pos;
            let event_text = &self.buffer[processed..event_end];

            if let Some(event) = Self::parse_event(event_text)? {
                events.push(event);
            }

            processed = event_end + 2;
        }

        if processed > 0 {
            self.buffer.drain(..processed);
        }

        Ok(events)
    }

    /// 解析单个 SSE 事件，忽略注释行与非 data 字段
    fn parse_event(event_text: &str) -> Result<Option<SseEvent>, LlmError> {
        let data: String = event_text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|line| line.trim_start())
            .collect::<Vec<_>>()
            .join("\n");

        if data.trim().is_empty() {
            return Ok(None);
        }
        if data.trim() == "[DONE]" {
            return Ok(Some(SseEvent::Done));
        }

        serde_json::from_str(&data)
            .map(|json| Some(SseEvent::Data(json)))
            .map_err(|e| LlmError::InvalidResponse(format!("bad SSE payload: {e}: {data}")))
    }

    /// 清空 buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_sse() {
        let mut parser = SseParser::new();
        let data = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n";

        let events = parser.parse_chunk(data).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            SseEvent::Data(json) => assert_eq!(json["choices"][0]["delta"]["content"], "Hello"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_done() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data: [DONE]\n\n").unwrap();
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[test]
    fn test_partial_event_is_buffered() {
        let mut parser = SseParser::new();
        assert!(parser.parse_chunk(b"data: {\"a\":").unwrap().is_empty());
        let events = parser.parse_chunk(b"1}\n\n").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_comment_lines_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b": keep-alive\n\n").unwrap();
        assert!(events.is_empty());
    }
}
