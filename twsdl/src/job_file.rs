// twsdl/src/job_file.rs
//! Job documents.
//!
//! A job stream is a sequence of XML documents separated by form feeds. Each
//! document is one `<request type="...">` with a `<query>` child. Once a
//! request has been answered the same document is written back with a
//! `<response>` child, so feeding a result stream back in only picks up the
//! requests that are still open.
//!
//! ```xml
//! <request type="historical_data">
//!   <query endDateTime="20240105 16:00:00" durationStr="1 W" barSizeSetting="1 hour" whatToShow="TRADES">
//!     <contract symbol="IBM" secType="STK" exchange="NYSE" currency="USD"/>
//!   </query>
//! </request>
//! ```

use std::io::{BufRead, Write};
use std::str::FromStr;

use log::{debug, info};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::account::{Execution, ExecutionFilter};
use crate::base::TwsDlError;
use crate::contract::{Contract, ContractDetails};
use crate::data::{Bar, Tick, TickValue};
use crate::order::{Order, OrderType, OrderSide, TimeInForce};
use crate::packet::{AccStatusRow, MktDataPacket, OrderRow, PlaceOrderPacket, QueryPacket, ReqError};
use crate::request::ReqKind;
use crate::todo::{ContractDetailsRequest, HistRequest, MktDataRequest, PlaceOrder, WorkTodo};

/// Document separator.
pub const SEPARATOR: u8 = b'\x0c';

const TYPE_PLACE_ORDER: &str = "place_order";
const TYPE_MKT_DATA: &str = "market_data";

/// One unanswered request read from a job stream.
#[derive(Debug, Clone, PartialEq)]
pub enum JobItem {
  AccStatus { account: String },
  Executions(ExecutionFilter),
  Orders,
  ContractDetails(ContractDetailsRequest),
  Hist(HistRequest),
  PlaceOrder(PlaceOrder),
  MktData(MktDataRequest),
}

// --- Minimal element tree ---

#[derive(Debug, Default, Clone)]
struct Node {
  name: String,
  attrs: Vec<(String, String)>,
  children: Vec<Node>,
  text: String,
}

impl Node {
  fn attr(&self, key: &str) -> Option<&str> {
    self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
  }

  fn child(&self, name: &str) -> Option<&Node> {
    self.children.iter().find(|c| c.name == name)
  }

  fn string(&self, key: &str) -> String {
    self.attr(key).unwrap_or_default().to_string()
  }

  fn opt_string(&self, key: &str) -> Option<String> {
    self.attr(key).filter(|s| !s.is_empty()).map(str::to_string)
  }

  fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, TwsDlError>
  where
    T::Err: std::fmt::Display,
  {
    match self.attr(key) {
      None | Some("") => Ok(None),
      Some(v) => v.parse::<T>().map(Some)
        .map_err(|e| TwsDlError::JobFile(format!("<{} {}=\"{}\">: {}", self.name, key, v, e))),
    }
  }

  fn flag(&self, key: &str, default: bool) -> Result<bool, TwsDlError> {
    match self.attr(key) {
      None | Some("") => Ok(default),
      Some("1") | Some("true") => Ok(true),
      Some("0") | Some("false") => Ok(false),
      Some(v) => Err(TwsDlError::JobFile(format!("<{} {}=\"{}\">: not a boolean", self.name, key, v))),
    }
  }
}

fn node_from(e: &BytesStart) -> Result<Node, TwsDlError> {
  let mut node = Node { name: String::from_utf8_lossy(e.name().as_ref()).into_owned(), ..Default::default() };
  for attr in e.attributes() {
    let attr = attr.map_err(|err| TwsDlError::JobFile(format!("XML attribute parsing error: {}", err)))?;
    let value = attr.unescape_value()
      .map_err(|err| TwsDlError::JobFile(format!("Attribute value unescape error: {}", err)))?;
    node.attrs.push((String::from_utf8_lossy(attr.key.as_ref()).into_owned(), value.into_owned()));
  }
  Ok(node)
}

fn attach(stack: &mut Vec<Node>, root: &mut Option<Node>, node: Node) -> Result<(), TwsDlError> {
  if let Some(parent) = stack.last_mut() {
    parent.children.push(node);
  } else if root.is_none() {
    *root = Some(node);
  } else {
    return Err(TwsDlError::JobFile("more than one root element in document".into()));
  }
  Ok(())
}

fn parse_tree(doc: &str) -> Result<Node, TwsDlError> {
  let mut reader = Reader::from_str(doc);
  reader.config_mut().trim_text(true);
  let mut stack: Vec<Node> = Vec::new();
  let mut root = None;
  loop {
    match reader.read_event() {
      Ok(Event::Start(e)) => stack.push(node_from(&e)?),
      Ok(Event::Empty(e)) => {
        let node = node_from(&e)?;
        attach(&mut stack, &mut root, node)?;
      }
      Ok(Event::End(_)) => {
        let node = stack.pop().ok_or_else(|| TwsDlError::JobFile("unbalanced end tag".into()))?;
        attach(&mut stack, &mut root, node)?;
      }
      Ok(Event::Text(t)) => {
        let text = t.unescape().map_err(|e| TwsDlError::JobFile(e.to_string()))?;
        if let Some(top) = stack.last_mut() {
          top.text.push_str(&text);
        }
      }
      Ok(Event::Eof) => break,
      Ok(_) => {}
      Err(e) => {
        return Err(TwsDlError::JobFile(format!("XML error at position {}: {}", reader.buffer_position(), e)));
      }
    }
  }
  if let Some(open) = stack.last() {
    return Err(TwsDlError::JobFile(format!("element <{}> not closed", open.name)));
  }
  root.ok_or_else(|| TwsDlError::JobFile("document has no element".into()))
}

// --- Reading ---

fn contract_from(node: &Node) -> Result<Contract, TwsDlError> {
  let mut c = Contract::new();
  c.con_id = node.parse("conId")?.unwrap_or(0);
  c.symbol = node.string("symbol");
  if let Some(st) = node.attr("secType").filter(|s| !s.is_empty()) {
    c.sec_type = st.parse().map_err(TwsDlError::JobFile)?;
  }
  c.last_trade_date_or_contract_month = node.opt_string("expiry");
  c.strike = node.parse("strike")?;
  c.right = match node.attr("right").filter(|s| !s.is_empty()) {
    Some(r) => Some(r.parse().map_err(TwsDlError::JobFile)?),
    None => None,
  };
  c.multiplier = node.opt_string("multiplier");
  c.exchange = node.string("exchange");
  c.primary_exchange = node.opt_string("primaryExchange");
  c.currency = node.string("currency");
  c.local_symbol = node.opt_string("localSymbol");
  c.trading_class = node.opt_string("tradingClass");
  c.include_expired = node.flag("includeExpired", false)?;
  c.sec_id_type = node.opt_string("secIdType");
  c.sec_id = node.opt_string("secId");
  Ok(c)
}

fn query_contract(query: &Node) -> Result<Contract, TwsDlError> {
  let node = query.child("contract")
    .ok_or_else(|| TwsDlError::JobFile("query without <contract>".into()))?;
  contract_from(node)
}

fn order_from(node: &Node) -> Result<Order, TwsDlError> {
  let mut o = Order::default();
  if let Some(a) = node.attr("action") {
    o.action = OrderSide::from_str(a).map_err(TwsDlError::JobFile)?;
  }
  o.total_quantity = node.parse("totalQuantity")?
    .ok_or_else(|| TwsDlError::JobFile("<order> without totalQuantity".into()))?;
  if let Some(t) = node.attr("orderType") {
    o.order_type = OrderType::from_str(t).map_err(TwsDlError::JobFile)?;
  }
  o.lmt_price = node.parse("lmtPrice")?;
  o.aux_price = node.parse("auxPrice")?;
  if let Some(t) = node.attr("tif") {
    o.tif = TimeInForce::from_str(t).map_err(TwsDlError::JobFile)?;
  }
  o.oca_group = node.opt_string("ocaGroup");
  o.account = node.opt_string("account");
  o.order_ref = node.opt_string("orderRef");
  o.transmit = node.flag("transmit", true)?;
  o.parent_id = node.parse("parentId")?.unwrap_or(0);
  o.outside_rth = node.flag("outsideRth", false)?;
  o.good_after_time = node.opt_string("goodAfterTime");
  o.good_till_date = node.opt_string("goodTillDate");
  o.what_if = node.flag("whatIf", false)?;
  Ok(o)
}

fn item_from(doc: &Node) -> Result<JobItem, TwsDlError> {
  if doc.name != "request" {
    return Err(TwsDlError::JobFile(format!("expected <request>, found <{}>", doc.name)));
  }
  let kind = doc.attr("type").unwrap_or_default();
  let empty = Node::default();
  let query = doc.child("query").unwrap_or(&empty);
  let item = match kind {
    "account" => JobItem::AccStatus { account: query.string("account") },
    "executions" => JobItem::Executions(ExecutionFilter {
      client_id: query.parse("clientId")?,
      acct_code: query.opt_string("acctCode"),
      time: query.opt_string("time"),
      symbol: query.opt_string("symbol"),
      sec_type: query.opt_string("secType"),
      exchange: query.opt_string("exchange"),
      side: query.opt_string("side"),
    }),
    "open_orders" => JobItem::Orders,
    "contract_details" => JobItem::ContractDetails(ContractDetailsRequest { contract: query_contract(query)? }),
    "historical_data" => JobItem::Hist(HistRequest {
      contract: query_contract(query)?,
      end_date_time: query.string("endDateTime"),
      duration: query.opt_string("durationStr")
        .ok_or_else(|| TwsDlError::JobFile("historical query without durationStr".into()))?,
      bar_size: query.opt_string("barSizeSetting")
        .ok_or_else(|| TwsDlError::JobFile("historical query without barSizeSetting".into()))?,
      what_to_show: query.opt_string("whatToShow").unwrap_or_else(|| "TRADES".to_string()),
      use_rth: query.flag("useRTH", true)?,
      format_date: query.parse("formatDate")?.unwrap_or(1),
    }),
    TYPE_PLACE_ORDER => JobItem::PlaceOrder(PlaceOrder {
      contract: query_contract(query)?,
      order: order_from(query.child("order")
        .ok_or_else(|| TwsDlError::JobFile("place_order query without <order>".into()))?)?,
      order_id: query.parse("orderId")?,
    }),
    TYPE_MKT_DATA => JobItem::MktData(MktDataRequest {
      contract: query_contract(query)?,
      generic_ticks: query.string("genericTicks"),
      snapshot: query.flag("snapshot", true)?,
    }),
    other => return Err(TwsDlError::JobFile(format!("unknown request type '{}'", other))),
  };
  Ok(item)
}

/// Reads job documents one at a time from a stream.
pub struct JobReader<R: BufRead> {
  input: R,
  docs: usize,
  answered: usize,
}

impl<R: BufRead> JobReader<R> {
  pub fn new(input: R) -> Self {
    Self { input, docs: 0, answered: 0 }
  }

  /// Next request that has no response yet, or `None` at end of input.
  pub fn next_pending(&mut self) -> Result<Option<JobItem>, TwsDlError> {
    let mut buf = Vec::new();
    loop {
      buf.clear();
      let n = self.input.read_until(SEPARATOR, &mut buf)?;
      if n == 0 {
        return Ok(None);
      }
      if buf.last() == Some(&SEPARATOR) {
        buf.pop();
      }
      let text = std::str::from_utf8(&buf)
        .map_err(|e| TwsDlError::JobFile(format!("document {} is not utf-8: {}", self.docs + 1, e)))?;
      if text.trim().is_empty() {
        continue;
      }
      self.docs += 1;
      let tree = parse_tree(text)
        .map_err(|e| TwsDlError::JobFile(format!("document {}: {}", self.docs, e)))?;
      if tree.child("response").is_some() {
        self.answered += 1;
        continue;
      }
      return item_from(&tree)
        .map(Some)
        .map_err(|e| TwsDlError::JobFile(format!("document {}: {}", self.docs, e)));
    }
  }

  /// Documents seen so far that already carried a response.
  pub fn answered(&self) -> usize {
    self.answered
  }
}

/// Queue every pending request of the stream. Returns how many were queued.
pub fn load_work<R: BufRead>(reader: &mut JobReader<R>, work: &mut WorkTodo) -> Result<usize, TwsDlError> {
  let mut n = 0;
  while let Some(item) = reader.next_pending()? {
    debug!("queueing {:?}", item);
    match item {
      JobItem::AccStatus { account } => {
        work.set_account(&account);
        work.add_simple_request(ReqKind::AccStatus);
      }
      JobItem::Executions(filter) => {
        work.set_exec_filter(filter);
        work.add_simple_request(ReqKind::Executions);
      }
      JobItem::Orders => work.add_simple_request(ReqKind::Orders),
      JobItem::ContractDetails(req) => work.contract_details().add(req),
      JobItem::Hist(req) => work.hist().add(req),
      JobItem::PlaceOrder(req) => work.place_orders().add(req),
      JobItem::MktData(req) => work.mkt_data().add(req),
    }
    n += 1;
  }
  info!("queued {} requests, skipped {} answered", n, reader.answered());
  Ok(n)
}

// --- Writing ---

/// A finished packet to report.
#[derive(Debug, Clone, Copy)]
pub enum Completed<'a> {
  Query(&'a QueryPacket),
  PlaceOrder(&'a PlaceOrderPacket),
  MktData(&'a MktDataPacket),
}

/// Receives finished packets.
pub trait ResponseSink {
  fn completed(&mut self, done: Completed<'_>) -> Result<(), TwsDlError>;
}

type XmlWriter = Writer<Vec<u8>>;

fn xml_err<E: std::fmt::Display>(e: E) -> TwsDlError {
  TwsDlError::JobFile(format!("XML write error: {}", e))
}

struct Elem {
  start: BytesStart<'static>,
}

impl Elem {
  fn new(name: &str) -> Self {
    Self { start: BytesStart::new(name.to_string()) }
  }

  fn attr(mut self, key: &str, value: &str) -> Self {
    self.start.push_attribute((key, value));
    self
  }

  fn opt<S: AsRef<str>>(self, key: &str, value: Option<S>) -> Self {
    match value {
      Some(v) if !v.as_ref().is_empty() => self.attr(key, v.as_ref()),
      _ => self,
    }
  }

  fn num<T: ToString>(self, key: &str, value: T) -> Self {
    let s = value.to_string();
    self.attr(key, &s)
  }

  fn empty(self, w: &mut XmlWriter) -> Result<(), TwsDlError> {
    w.write_event(Event::Empty(self.start)).map_err(xml_err)
  }

  fn open(self, w: &mut XmlWriter) -> Result<String, TwsDlError> {
    let name = String::from_utf8_lossy(self.start.name().as_ref()).into_owned();
    w.write_event(Event::Start(self.start)).map_err(xml_err)?;
    Ok(name)
  }
}

fn close(w: &mut XmlWriter, name: &str) -> Result<(), TwsDlError> {
  w.write_event(Event::End(BytesEnd::new(name))).map_err(xml_err)
}

fn write_contract(w: &mut XmlWriter, c: &Contract) -> Result<(), TwsDlError> {
  let mut e = Elem::new("contract");
  if c.con_id != 0 {
    e = e.num("conId", c.con_id);
  }
  e = e.attr("symbol", &c.symbol)
    .attr("secType", &c.sec_type.to_string())
    .opt("expiry", c.last_trade_date_or_contract_month.as_deref());
  if let Some(strike) = c.strike {
    e = e.num("strike", strike);
  }
  if let Some(right) = c.right {
    e = e.num("right", right);
  }
  e = e.opt("multiplier", c.multiplier.as_deref())
    .attr("exchange", &c.exchange)
    .opt("primaryExchange", c.primary_exchange.as_deref())
    .attr("currency", &c.currency)
    .opt("localSymbol", c.local_symbol.as_deref())
    .opt("tradingClass", c.trading_class.as_deref());
  if c.include_expired {
    e = e.attr("includeExpired", "1");
  }
  e.opt("secIdType", c.sec_id_type.as_deref())
    .opt("secId", c.sec_id.as_deref())
    .empty(w)
}

fn write_order(w: &mut XmlWriter, o: &Order) -> Result<(), TwsDlError> {
  let mut e = Elem::new("order")
    .num("action", o.action)
    .num("totalQuantity", o.total_quantity)
    .num("orderType", o.order_type);
  if let Some(p) = o.lmt_price {
    e = e.num("lmtPrice", p);
  }
  if let Some(p) = o.aux_price {
    e = e.num("auxPrice", p);
  }
  e = e.num("tif", o.tif)
    .opt("ocaGroup", o.oca_group.as_deref())
    .opt("account", o.account.as_deref())
    .opt("orderRef", o.order_ref.as_deref());
  if !o.transmit {
    e = e.attr("transmit", "0");
  }
  if o.parent_id != 0 {
    e = e.num("parentId", o.parent_id);
  }
  if o.outside_rth {
    e = e.attr("outsideRth", "1");
  }
  e = e.opt("goodAfterTime", o.good_after_time.as_deref())
    .opt("goodTillDate", o.good_till_date.as_deref());
  if o.what_if {
    e = e.attr("whatIf", "1");
  }
  e.empty(w)
}

fn write_bar(w: &mut XmlWriter, b: &Bar) -> Result<(), TwsDlError> {
  Elem::new("bar")
    .attr("date", &b.date)
    .num("open", b.open)
    .num("high", b.high)
    .num("low", b.low)
    .num("close", b.close)
    .num("volume", b.volume)
    .num("wap", b.wap)
    .attr("hasGaps", if b.has_gaps { "1" } else { "0" })
    .num("count", b.count)
    .empty(w)
}

fn write_details(w: &mut XmlWriter, d: &ContractDetails) -> Result<(), TwsDlError> {
  let name = Elem::new("details")
    .attr("marketName", &d.market_name)
    .num("minTick", d.min_tick)
    .attr("orderTypes", &d.order_types)
    .attr("validExchanges", &d.valid_exchanges)
    .num("priceMagnifier", d.price_magnifier)
    .num("underConId", d.under_con_id)
    .attr("longName", &d.long_name)
    .opt("contractMonth", Some(&d.contract_month))
    .opt("industry", Some(&d.industry))
    .opt("category", Some(&d.category))
    .opt("subcategory", Some(&d.subcategory))
    .attr("timeZoneId", &d.time_zone_id)
    .attr("tradingHours", &d.trading_hours)
    .attr("liquidHours", &d.liquid_hours)
    .opt("evRule", Some(&d.ev_rule))
    .open(w)?;
  write_contract(w, &d.contract)?;
  for (tag, value) in &d.sec_id_list {
    Elem::new("secId").attr("tag", tag).attr("value", value).empty(w)?;
  }
  close(w, &name)
}

fn write_execution(w: &mut XmlWriter, x: &Execution) -> Result<(), TwsDlError> {
  let name = Elem::new("execution")
    .num("orderId", x.order_id)
    .attr("execId", &x.exec_id)
    .attr("time", &x.time)
    .attr("account", &x.account)
    .attr("exchange", &x.exchange)
    .attr("side", &x.side)
    .num("shares", x.shares)
    .num("price", x.price)
    .num("permId", x.perm_id)
    .num("clientId", x.client_id)
    .num("liquidation", x.liquidation)
    .num("cumQty", x.cum_qty)
    .num("avgPrice", x.avg_price)
    .opt("orderRef", Some(&x.order_ref))
    .open(w)?;
  write_contract(w, &x.contract)?;
  close(w, &name)
}

fn write_order_row(w: &mut XmlWriter, row: &OrderRow) -> Result<(), TwsDlError> {
  match row {
    OrderRow::Status(s) => Elem::new("orderStatus")
      .num("orderId", s.order_id)
      .num("status", s.status)
      .num("filled", s.filled)
      .num("remaining", s.remaining)
      .num("avgFillPrice", s.avg_fill_price)
      .num("permId", s.perm_id)
      .num("parentId", s.parent_id)
      .num("lastFillPrice", s.last_fill_price)
      .num("clientId", s.client_id)
      .opt("whyHeld", Some(&s.why_held))
      .empty(w),
    OrderRow::Open(o) => {
      let name = Elem::new("openOrder")
        .num("orderId", o.order_id)
        .attr("action", &o.action)
        .num("totalQuantity", o.total_quantity)
        .attr("orderType", &o.order_type)
        .num("lmtPrice", o.lmt_price)
        .num("auxPrice", o.aux_price)
        .attr("tif", &o.tif)
        .attr("account", &o.account)
        .opt("orderRef", Some(&o.order_ref))
        .num("clientId", o.client_id)
        .num("permId", o.perm_id)
        .open(w)?;
      write_contract(w, &o.contract)?;
      close(w, &name)
    }
  }
}

fn write_acc_row(w: &mut XmlWriter, row: &AccStatusRow) -> Result<(), TwsDlError> {
  match row {
    AccStatusRow::Value(v) => Elem::new("value")
      .attr("key", &v.key)
      .attr("value", &v.value)
      .attr("currency", &v.currency)
      .attr("account", &v.account)
      .empty(w),
    AccStatusRow::Portfolio(p) => {
      let name = Elem::new("portfolio")
        .num("position", p.position)
        .num("marketPrice", p.market_price)
        .num("marketValue", p.market_value)
        .num("averageCost", p.average_cost)
        .num("unrealizedPNL", p.unrealized_pnl)
        .num("realizedPNL", p.realized_pnl)
        .attr("account", &p.account)
        .open(w)?;
      write_contract(w, &p.contract)?;
      close(w, &name)
    }
    AccStatusRow::UpdateTime(t) => {
      let name = Elem::new("updateTime").open(w)?;
      w.write_event(Event::Text(BytesText::new(t))).map_err(xml_err)?;
      close(w, &name)
    }
  }
}

fn write_tick(w: &mut XmlWriter, t: &Tick) -> Result<(), TwsDlError> {
  let e = Elem::new("tick").num("field", t.field).num("type", t.kind());
  match t.value {
    TickValue::Price(p) => e.num("price", p),
    TickValue::Size(s) => e.num("size", s),
  }
  .empty(w)
}

fn write_exec_filter(e: Elem, f: &ExecutionFilter) -> Elem {
  let e = match f.client_id {
    Some(id) => e.num("clientId", id),
    None => e,
  };
  e.opt("acctCode", f.acct_code.as_deref())
    .opt("time", f.time.as_deref())
    .opt("symbol", f.symbol.as_deref())
    .opt("secType", f.sec_type.as_deref())
    .opt("exchange", f.exchange.as_deref())
    .opt("side", f.side.as_deref())
}

fn write_hist_query(w: &mut XmlWriter, q: &HistRequest) -> Result<(), TwsDlError> {
  let name = Elem::new("query")
    .attr("endDateTime", &q.end_date_time)
    .attr("durationStr", &q.duration)
    .attr("barSizeSetting", &q.bar_size)
    .attr("whatToShow", &q.what_to_show)
    .attr("useRTH", if q.use_rth { "1" } else { "0" })
    .num("formatDate", q.format_date)
    .open(w)?;
  write_contract(w, &q.contract)?;
  close(w, &name)
}

fn open_response(w: &mut XmlWriter, err: ReqError) -> Result<String, TwsDlError> {
  Elem::new("response").attr("error", err.as_str()).open(w)
}

/// Render a finished packet as one job document, without separator.
pub fn serialize_completed(done: Completed<'_>) -> Result<String, TwsDlError> {
  let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
  let wr = &mut w;
  match done {
    Completed::Query(QueryPacket::AccStatus(p)) => {
      let req = Elem::new("request").num("type", ReqKind::AccStatus).open(wr)?;
      Elem::new("query").opt("account", Some(p.query())).empty(wr)?;
      let resp = open_response(wr, p.error())?;
      for row in p.rows() {
        write_acc_row(wr, row)?;
      }
      close(wr, &resp)?;
      close(wr, &req)?;
    }
    Completed::Query(QueryPacket::Executions(p)) => {
      let req = Elem::new("request").num("type", ReqKind::Executions).open(wr)?;
      write_exec_filter(Elem::new("query"), p.query()).empty(wr)?;
      let resp = open_response(wr, p.error())?;
      for row in p.rows() {
        write_execution(wr, row)?;
      }
      close(wr, &resp)?;
      close(wr, &req)?;
    }
    Completed::Query(QueryPacket::Orders(p)) => {
      let req = Elem::new("request").num("type", ReqKind::Orders).open(wr)?;
      Elem::new("query").empty(wr)?;
      let resp = open_response(wr, p.error())?;
      for row in p.rows() {
        write_order_row(wr, row)?;
      }
      close(wr, &resp)?;
      close(wr, &req)?;
    }
    Completed::Query(QueryPacket::ContractDetails(p)) => {
      let req = Elem::new("request").num("type", ReqKind::ContractDetails).open(wr)?;
      let q = Elem::new("query").open(wr)?;
      write_contract(wr, &p.query().contract)?;
      close(wr, &q)?;
      let resp = open_response(wr, p.error())?;
      for row in p.rows() {
        write_details(wr, row)?;
      }
      close(wr, &resp)?;
      close(wr, &req)?;
    }
    Completed::Query(QueryPacket::Hist(p)) => {
      let req = Elem::new("request").num("type", ReqKind::Hist).open(wr)?;
      write_hist_query(wr, p.query())?;
      let resp = open_response(wr, p.error())?;
      for row in p.rows() {
        write_bar(wr, row)?;
      }
      close(wr, &resp)?;
      close(wr, &req)?;
    }
    Completed::PlaceOrder(p) => {
      let req = Elem::new("request").attr("type", TYPE_PLACE_ORDER).open(wr)?;
      let q = Elem::new("query").num("orderId", p.req_id()).open(wr)?;
      write_contract(wr, &p.query().contract)?;
      write_order(wr, &p.query().order)?;
      close(wr, &q)?;
      let resp = open_response(wr, p.error())?;
      for row in p.rows() {
        write_order_row(wr, row)?;
      }
      close(wr, &resp)?;
      close(wr, &req)?;
    }
    Completed::MktData(p) => {
      let req = Elem::new("request").attr("type", TYPE_MKT_DATA).open(wr)?;
      let q = Elem::new("query")
        .attr("genericTicks", &p.query().generic_ticks)
        .attr("snapshot", if p.query().snapshot { "1" } else { "0" })
        .open(wr)?;
      write_contract(wr, &p.query().contract)?;
      close(wr, &q)?;
      let resp = open_response(wr, p.error())?;
      for row in p.rows() {
        write_tick(wr, row)?;
      }
      close(wr, &resp)?;
      close(wr, &req)?;
    }
  }
  String::from_utf8(w.into_inner()).map_err(xml_err)
}

/// Writes finished packets as job documents.
pub struct XmlSink<W: Write> {
  out: W,
  written: usize,
}

impl<W: Write> XmlSink<W> {
  pub fn new(out: W) -> Self {
    Self { out, written: 0 }
  }

  pub fn written(&self) -> usize {
    self.written
  }

  pub fn into_inner(self) -> W {
    self.out
  }
}

impl<W: Write> ResponseSink for XmlSink<W> {
  fn completed(&mut self, done: Completed<'_>) -> Result<(), TwsDlError> {
    let doc = serialize_completed(done)?;
    self.out.write_all(doc.as_bytes())?;
    self.out.write_all(&[b'\n', SEPARATOR, b'\n'])?;
    self.out.flush()?;
    self.written += 1;
    Ok(())
  }
}

/// Keeps finished documents in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
  pub docs: Vec<String>,
  /// (type, classification, rows) per document
  pub summary: Vec<(String, ReqError, usize)>,
}

impl ResponseSink for MemorySink {
  fn completed(&mut self, done: Completed<'_>) -> Result<(), TwsDlError> {
    let entry = match done {
      Completed::Query(p) => (p.kind().to_string(), p.error(), p.row_count()),
      Completed::PlaceOrder(p) => (TYPE_PLACE_ORDER.to_string(), p.error(), p.rows().len()),
      Completed::MktData(p) => (TYPE_MKT_DATA.to_string(), p.error(), p.rows().len()),
    };
    self.docs.push(serialize_completed(done)?);
    self.summary.push(entry);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::packet::Packet;
  use std::io::{BufReader, Cursor};

  const JOBS: &str = concat!(
    r#"<request type="historical_data">
  <query endDateTime="20240105 16:00:00" durationStr="1 W" barSizeSetting="1 hour" whatToShow="BID" useRTH="0">
    <contract symbol="IBM" secType="STK" exchange="NYSE" currency="USD"/>
  </query>
</request>
"#,
    "\x0c",
    r#"
<request type="contract_details">
  <query><contract symbol="SAP" secType="STK" exchange="IBIS" currency="EUR"/></query>
  <response error="none"/>
</request>
"#,
    "\x0c",
    r#"<request type="account"><query account="DU123"/></request>
"#,
    "\x0c\n\x0c",
    r#"
<request type="place_order">
  <query>
    <contract symbol="IBM" secType="STK" exchange="SMART" currency="USD"/>
    <order action="SELL" totalQuantity="10" orderType="LMT" lmtPrice="150.5" tif="GTC"/>
  </query>
</request>
"#,
  );

  #[test]
  fn test_reads_pending_and_skips_answered() {
    let mut reader = JobReader::new(Cursor::new(JOBS.as_bytes()));
    let first = reader.next_pending().unwrap().unwrap();
    match first {
      JobItem::Hist(h) => {
        assert_eq!(h.contract.symbol, "IBM");
        assert_eq!(h.what_to_show, "BID");
        assert!(!h.use_rth);
        assert_eq!(h.format_date, 1);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(reader.next_pending().unwrap(), Some(JobItem::AccStatus { account: "DU123".into() }));
    assert_eq!(reader.answered(), 1);
    match reader.next_pending().unwrap().unwrap() {
      JobItem::PlaceOrder(po) => {
        assert_eq!(po.order.action, OrderSide::Sell);
        assert_eq!(po.order.lmt_price, Some(150.5));
        assert_eq!(po.order.tif, TimeInForce::GoodTillCancelled);
        assert_eq!(po.order_id, None);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert!(reader.next_pending().unwrap().is_none());
  }

  #[test]
  fn test_load_work_fills_queues() {
    let mut reader = JobReader::new(BufReader::new(JOBS.as_bytes()));
    let mut work = WorkTodo::new();
    assert_eq!(load_work(&mut reader, &mut work).unwrap(), 3);
    assert_eq!(work.account(), "DU123");
    assert_eq!(work.place_orders_left(), 1);
    assert_eq!(work.next_req_type(), ReqKind::AccStatus);
    assert_eq!(work.next_req_type(), ReqKind::Hist);
  }

  #[test]
  fn test_bad_documents() {
    let mut r = JobReader::new(Cursor::new(b"<request type=\"bogus\"><query/></request>".as_slice()));
    assert!(matches!(r.next_pending(), Err(TwsDlError::JobFile(_))));
    let mut r = JobReader::new(Cursor::new(b"<request type=\"historical_data\"><query>".as_slice()));
    assert!(r.next_pending().is_err());
    let mut r = JobReader::new(Cursor::new(
      b"<request type=\"historical_data\"><query durationStr=\"1 D\"/></request>".as_slice()));
    assert!(r.next_pending().is_err());
  }

  #[test]
  fn test_completed_document_is_skipped_on_reload() {
    let req = HistRequest::new(Contract::stock_with_exchange("IBM", "NYSE", "USD"), "", "1 D", "1 day", "TRADES");
    let mut p = Packet::new(req);
    p.record(3, 0).unwrap();
    p.append(Bar { date: "20240102".into(), open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 10,
                   wap: 1.2, has_gaps: false, count: 3 });
    p.close_error(ReqError::None);
    let qp = QueryPacket::Hist(p);

    let mut sink = XmlSink::new(Vec::new());
    sink.completed(Completed::Query(&qp)).unwrap();
    assert_eq!(sink.written(), 1);
    let out = String::from_utf8(sink.into_inner()).unwrap();
    assert!(out.contains("<bar date=\"20240102\""));
    assert!(out.contains("error=\"none\""));

    let mut reader = JobReader::new(Cursor::new(out.into_bytes()));
    assert!(reader.next_pending().unwrap().is_none());
    assert_eq!(reader.answered(), 1);
  }

  #[test]
  fn test_tempfile_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(JOBS.as_bytes()).unwrap();
    let f = std::fs::File::open(file.path()).unwrap();
    let mut reader = JobReader::new(BufReader::new(f));
    let mut n = 0;
    while reader.next_pending().unwrap().is_some() {
      n += 1;
    }
    assert_eq!(n, 3);
  }
}
