//! Streaming BPMN XML reader.
//!
//! Walks the `quick-xml` event stream once and fills a [`Process`]. Namespace
//! prefixes are ignored, so `bpmn:serviceTask`, `serviceTask` and
//! `zeebe:taskDefinition` all match on their local names.

use super::{Element, ElementType, EventDefinition, Mapping, Process, SequenceFlow};
use crate::error::BpmnError;
use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeSet;

/// Which text node the reader is currently collecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TextSlot {
    Incoming,
    Outgoing,
    Condition,
    TimeDuration,
}

#[derive(Default)]
struct ProcessBuilder {
    process: Option<Process>,
    in_process: bool,
    element: Option<Element>,
    flow: Option<SequenceFlow>,
    slot: Option<TextSlot>,
    messages: Vec<(String, String)>,
}

/// Parse a BPMN `definitions` document and return its first `process`.
pub fn parse_definitions(source: &str) -> Result<Process, BpmnError> {
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(true);

    let mut builder = ProcessBuilder::default();
    loop {
        let event = reader.read_event().map_err(|e| {
            BpmnError::Parse(format!(
                "XML error at position {}: {e}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(start) => builder.open(&start, false)?,
            Event::Empty(start) => builder.open(&start, true)?,
            Event::End(end) => builder.close(end.local_name().as_ref()),
            Event::Text(text) => {
                if let Some(slot) = builder.slot {
                    let value = text
                        .unescape_with(resolve_html5_entity)
                        .map_err(|e| BpmnError::Parse(e.to_string()))?;
                    builder.push_text(slot, &value);
                }
            }
            Event::CData(data) => {
                if let Some(slot) = builder.slot {
                    let raw = data.into_inner();
                    builder.push_text(slot, &String::from_utf8_lossy(&raw));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    builder.finish()
}

impl ProcessBuilder {
    fn open(&mut self, start: &BytesStart<'_>, empty: bool) -> Result<(), BpmnError> {
        let local = start.local_name();
        let tag = local.as_ref();

        if tag == b"process" {
            if self.process.is_none() {
                self.process = Some(Process {
                    id: required_attr(start, b"id", "process")?,
                    name: attr(start, b"name")?.unwrap_or_default(),
                    ..Default::default()
                });
                self.in_process = !empty;
            }
            return Ok(());
        }

        if tag == b"message" && self.element.is_none() {
            if let Some(id) = attr(start, b"id")? {
                let name = attr(start, b"name")?.unwrap_or_default();
                self.messages.push((id, name));
            }
            return Ok(());
        }

        if !self.in_process {
            return Ok(());
        }

        if let Some(kind) = ElementType::from_tag(tag) {
            if self.element.is_none() {
                let id = required_attr(start, b"id", "element")?;
                let name = attr(start, b"name")?.unwrap_or_default();
                self.element = Some(Element::new(id, name, kind));
                if empty {
                    self.close(tag);
                }
            }
            return Ok(());
        }

        if tag == b"sequenceFlow" {
            self.flow = Some(SequenceFlow {
                id: required_attr(start, b"id", "sequenceFlow")?,
                name: attr(start, b"name")?.unwrap_or_default(),
                source_ref: required_attr(start, b"sourceRef", "sequenceFlow")?,
                target_ref: required_attr(start, b"targetRef", "sequenceFlow")?,
                conditions: Vec::new(),
            });
            if empty {
                self.close(tag);
            }
            return Ok(());
        }

        if tag == b"conditionExpression" {
            if let Some(flow) = self.flow.as_mut() {
                flow.conditions.push(String::new());
                if !empty {
                    self.slot = Some(TextSlot::Condition);
                }
            }
            return Ok(());
        }

        let Some(element) = self.element.as_mut() else {
            return Ok(());
        };

        match tag {
            b"incoming" if !empty => self.slot = Some(TextSlot::Incoming),
            b"outgoing" if !empty => self.slot = Some(TextSlot::Outgoing),
            b"messageEventDefinition" => {
                element.event_definition = Some(EventDefinition::Message {
                    message_ref: attr(start, b"messageRef")?,
                });
            }
            b"timerEventDefinition" => {
                element.event_definition = Some(EventDefinition::Timer { duration: None });
            }
            b"timeDuration" if !empty => self.slot = Some(TextSlot::TimeDuration),
            b"linkEventDefinition" => {
                element.event_definition = Some(EventDefinition::Link {
                    name: attr(start, b"name")?.unwrap_or_default(),
                });
            }
            b"taskDefinition" => {
                element.task_type = attr(start, b"type")?;
            }
            b"assignmentDefinition" => {
                element.assignee = attr(start, b"assignee")?.filter(|a| !a.trim().is_empty());
                element.candidate_groups = attr(start, b"candidateGroups")?
                    .map(|groups| split_groups(&groups))
                    .unwrap_or_default();
            }
            b"input" | b"output" => {
                let mapping = Mapping {
                    source: attr(start, b"source")?.unwrap_or_default(),
                    target: attr(start, b"target")?.unwrap_or_default(),
                };
                if tag == b"input" {
                    element.inputs.push(mapping);
                } else {
                    element.outputs.push(mapping);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, tag: &[u8]) {
        match tag {
            b"process" => self.in_process = false,
            b"sequenceFlow" => {
                if let (Some(flow), Some(process)) = (self.flow.take(), self.process.as_mut()) {
                    process.sequence_flows.push(flow);
                }
            }
            b"incoming" | b"outgoing" | b"conditionExpression" | b"timeDuration" => {
                self.slot = None;
            }
            _ => {
                let closes_element = self
                    .element
                    .as_ref()
                    .is_some_and(|e| ElementType::from_tag(tag) == Some(e.kind));
                if closes_element {
                    if let (Some(element), Some(process)) =
                        (self.element.take(), self.process.as_mut())
                    {
                        process.elements.push(element);
                    }
                }
            }
        }
    }

    fn push_text(&mut self, slot: TextSlot, text: &str) {
        match slot {
            TextSlot::Condition => {
                if let Some(condition) = self.flow.as_mut().and_then(|f| f.conditions.last_mut()) {
                    condition.push_str(text);
                }
            }
            TextSlot::Incoming | TextSlot::Outgoing | TextSlot::TimeDuration => {
                let Some(element) = self.element.as_mut() else {
                    return;
                };
                let text = text.trim();
                match slot {
                    TextSlot::Incoming => element.incoming.push(text.to_string()),
                    TextSlot::Outgoing => element.outgoing.push(text.to_string()),
                    _ => {
                        if let Some(EventDefinition::Timer { duration }) =
                            element.event_definition.as_mut()
                        {
                            duration.get_or_insert_with(String::new).push_str(text);
                        }
                    }
                }
            }
        }
    }

    fn finish(self) -> Result<Process, BpmnError> {
        let mut process = self
            .process
            .ok_or_else(|| BpmnError::Parse("document contains no <process> element".into()))?;
        process.messages.extend(self.messages);

        for flow in &mut process.sequence_flows {
            for condition in &mut flow.conditions {
                let decoded = unescape_with(condition.as_str(), resolve_html5_entity).map(|c| c.into_owned());
                if let Ok(decoded) = decoded {
                    *condition = decoded;
                }
            }
        }

        let ids: BTreeSet<&str> = process.elements.iter().map(|e| e.id.as_str()).collect();
        for flow in &process.sequence_flows {
            for endpoint in [&flow.source_ref, &flow.target_ref] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(BpmnError::Parse(format!(
                        "sequence flow '{}' references unknown element '{}'",
                        flow.id, endpoint
                    )));
                }
            }
        }

        let flows = process.sequence_flows.clone();
        for element in &mut process.elements {
            if element.incoming.is_empty() {
                element.incoming = flows
                    .iter()
                    .filter(|f| f.target_ref == element.id)
                    .map(|f| f.id.clone())
                    .collect();
            }
            if element.outgoing.is_empty() {
                element.outgoing = flows
                    .iter()
                    .filter(|f| f.source_ref == element.id)
                    .map(|f| f.id.clone())
                    .collect();
            }
        }

        Ok(process)
    }
}

fn attr(start: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, BpmnError> {
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| BpmnError::Parse(e.to_string()))?;
        if attribute.key.local_name().as_ref() == key {
            let value = attribute
                .unescape_value()
                .map_err(|e| BpmnError::Parse(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required_attr(start: &BytesStart<'_>, key: &[u8], what: &str) -> Result<String, BpmnError> {
    attr(start, key)?.ok_or_else(|| {
        BpmnError::Parse(format!(
            "<{what}> is missing attribute '{}'",
            String::from_utf8_lossy(key)
        ))
    })
}

fn split_groups(groups: &str) -> Vec<String> {
    groups
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL"
                  xmlns:zeebe="http://camunda.org/schema/zeebe/1.0">
  <bpmn:process id="order" name="Order" isExecutable="true">
    <bpmn:startEvent id="start">
      <bpmn:outgoing>f1</bpmn:outgoing>
    </bpmn:startEvent>
    <bpmn:serviceTask id="charge" name="Charge">
      <bpmn:extensionElements>
        <zeebe:taskDefinition type="payment" />
        <zeebe:ioMapping>
          <zeebe:input source="=amount" target="total" />
          <zeebe:output source="=receipt" target="receiptId" />
        </zeebe:ioMapping>
      </bpmn:extensionElements>
      <bpmn:incoming>f1</bpmn:incoming>
      <bpmn:outgoing>f2</bpmn:outgoing>
    </bpmn:serviceTask>
    <bpmn:exclusiveGateway id="gw" />
    <bpmn:userTask id="review" name="Review">
      <bpmn:extensionElements>
        <zeebe:assignmentDefinition assignee="alex" candidateGroups=" finance, , ops " />
      </bpmn:extensionElements>
    </bpmn:userTask>
    <bpmn:intermediateCatchEvent id="wait">
      <bpmn:timerEventDefinition id="td">
        <bpmn:timeDuration xsi:type="bpmn:tFormalExpression">PT1S</bpmn:timeDuration>
      </bpmn:timerEventDefinition>
    </bpmn:intermediateCatchEvent>
    <bpmn:intermediateCatchEvent id="paid" name="Paid">
      <bpmn:messageEventDefinition id="md" messageRef="msg-paid" />
    </bpmn:intermediateCatchEvent>
    <bpmn:endEvent id="end" />
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="charge" />
    <bpmn:sequenceFlow id="f2" sourceRef="charge" targetRef="gw" />
    <bpmn:sequenceFlow id="f3" sourceRef="gw" targetRef="review">
      <bpmn:conditionExpression xsi:type="tFormalExpression">= total &gt;= 100</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
    <bpmn:sequenceFlow id="f4" sourceRef="gw" targetRef="wait" />
    <bpmn:sequenceFlow id="f5" sourceRef="wait" targetRef="paid" />
    <bpmn:sequenceFlow id="f6" sourceRef="paid" targetRef="end" />
    <bpmn:sequenceFlow id="f7" sourceRef="review" targetRef="end" />
  </bpmn:process>
  <bpmn:message id="msg-paid" name="payment-received" />
</bpmn:definitions>"#;

    #[test]
    fn test_parse_elements_in_document_order() {
        let process = parse_definitions(ORDER).unwrap();
        assert_eq!(process.id, "order");
        assert_eq!(process.name, "Order");
        let ids: Vec<&str> = process.elements.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["start", "charge", "gw", "review", "wait", "paid", "end"]);
        assert_eq!(process.sequence_flows.len(), 7);
    }

    #[test]
    fn test_parse_task_extensions() {
        let process = parse_definitions(ORDER).unwrap();
        let charge = &process.elements[1];
        assert_eq!(charge.task_type.as_deref(), Some("payment"));
        assert_eq!(charge.inputs[0].source, "=amount");
        assert_eq!(charge.inputs[0].target, "total");
        assert_eq!(charge.outputs[0].target, "receiptId");

        let review = &process.elements[3];
        assert_eq!(review.assignee.as_deref(), Some("alex"));
        assert_eq!(review.candidate_groups, vec!["finance", "ops"]);
    }

    #[test]
    fn test_parse_event_definitions_and_messages() {
        let process = parse_definitions(ORDER).unwrap();
        assert_eq!(
            process.elements[4].event_definition,
            Some(EventDefinition::Timer {
                duration: Some("PT1S".into())
            })
        );
        assert_eq!(process.message_name(&process.elements[5]), "payment-received");
    }

    #[test]
    fn test_condition_is_unescaped() {
        let process = parse_definitions(ORDER).unwrap();
        let flow = process.find_flow("f3").unwrap();
        assert_eq!(flow.condition(), Some("= total >= 100"));
        assert!(!process.find_flow("f4").unwrap().has_condition());
    }

    #[test]
    fn test_condition_resolves_html_entities() {
        let source = r#"<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="entities">
    <bpmn:startEvent id="start" />
    <bpmn:exclusiveGateway id="gw" />
    <bpmn:endEvent id="end" />
    <bpmn:sequenceFlow id="to-gw" sourceRef="start" targetRef="gw" />
    <bpmn:sequenceFlow id="to-end" sourceRef="gw" targetRef="end">
      <bpmn:conditionExpression>= city = "Z&amp;uuml;rich" and total &amp;lt;=&amp;nbsp;5</bpmn:conditionExpression>
    </bpmn:sequenceFlow>
  </bpmn:process>
</bpmn:definitions>"#;
        let process = parse_definitions(source).unwrap();
        assert_eq!(
            process.find_flow("to-end").unwrap().condition(),
            Some("= city = \"Z\u{fc}rich\" and total <=\u{a0}5")
        );
    }

    #[test]
    fn test_missing_associations_are_derived_from_flows() {
        let process = parse_definitions(ORDER).unwrap();
        let gw = &process.elements[2];
        assert_eq!(gw.incoming, vec!["f2"]);
        assert_eq!(gw.outgoing, vec!["f3", "f4"]);
        let end = &process.elements[6];
        assert_eq!(end.incoming, vec!["f6", "f7"]);
    }

    #[test]
    fn test_unknown_flow_target_is_rejected() {
        let xml = r#"<definitions><process id="p">
            <startEvent id="s"/>
            <sequenceFlow id="f" sourceRef="s" targetRef="nowhere"/>
        </process></definitions>"#;
        let err = parse_definitions(xml).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_document_without_process_is_rejected() {
        let err = parse_definitions("<definitions/>").unwrap_err();
        assert!(matches!(err, BpmnError::Parse(_)));
    }

    #[test]
    fn test_malformed_xml_is_rejected() {
        let err = parse_definitions("<definitions><process id=\"p\"></definitions>").unwrap_err();
        assert!(matches!(err, BpmnError::Parse(_)));
    }
}
