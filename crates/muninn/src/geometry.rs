//! Two-dimensional WGS84 geometry with WKT parse and format support.
//!
//! Coordinates are `(longitude, latitude)` in degrees. Only the 2-D subset
//! of WKT is accepted: `POINT`, `LINESTRING`, `POLYGON`, `MULTIPOINT`,
//! `MULTILINESTRING` and `MULTIPOLYGON`, each with `EMPTY` support.
//! Polygon rings must be closed (first position equals the last) and the
//! exterior ring is normalized to counter-clockwise winding on parse.

use std::fmt;

#[derive(thiserror::Error, Debug)]
#[error("invalid WKT: {0}")]
pub struct WktError(String);

/// A single WGS84 position in degrees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
}

impl Position {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    /// `None` is the empty point.
    Point(Option<Position>),
    LineString(Vec<Position>),
    /// Rings, exterior first. Each ring is closed.
    Polygon(Vec<Vec<Position>>),
    MultiPoint(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

impl Geometry {
    pub fn is_empty(&self) -> bool {
        match self {
            Geometry::Point(p) => p.is_none(),
            Geometry::LineString(p) | Geometry::MultiPoint(p) => p.is_empty(),
            Geometry::Polygon(r) | Geometry::MultiLineString(r) => r.is_empty(),
            Geometry::MultiPolygon(p) => p.is_empty(),
        }
    }

    /// Parse a WKT string.
    pub fn from_wkt(text: &str) -> Result<Geometry, WktError> {
        let mut scanner = Scanner::new(text);
        let geometry = scanner.geometry()?;
        scanner.skip_whitespace();
        if !scanner.at_end() {
            return Err(WktError(format!(
                "trailing content at offset {}",
                scanner.pos
            )));
        }
        Ok(geometry)
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geometry::Point(None) => write!(f, "POINT EMPTY"),
            Geometry::Point(Some(p)) => write!(f, "POINT ({} {})", p.lon, p.lat),
            Geometry::LineString(points) => {
                write!(f, "LINESTRING ")?;
                write_positions(f, points)
            }
            Geometry::Polygon(rings) => {
                write!(f, "POLYGON ")?;
                write_rings(f, rings)
            }
            Geometry::MultiPoint(points) => {
                if points.is_empty() {
                    return write!(f, "MULTIPOINT EMPTY");
                }
                write!(f, "MULTIPOINT (")?;
                for (i, p) in points.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({} {})", p.lon, p.lat)?;
                }
                write!(f, ")")
            }
            Geometry::MultiLineString(lines) => {
                write!(f, "MULTILINESTRING ")?;
                write_rings(f, lines)
            }
            Geometry::MultiPolygon(polygons) => {
                if polygons.is_empty() {
                    return write!(f, "MULTIPOLYGON EMPTY");
                }
                write!(f, "MULTIPOLYGON (")?;
                for (i, rings) in polygons.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_rings(f, rings)?;
                }
                write!(f, ")")
            }
        }
    }
}

fn write_positions(f: &mut fmt::Formatter<'_>, points: &[Position]) -> fmt::Result {
    if points.is_empty() {
        return write!(f, "EMPTY");
    }
    write!(f, "(")?;
    for (i, p) in points.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{} {}", p.lon, p.lat)?;
    }
    write!(f, ")")
}

fn write_rings(f: &mut fmt::Formatter<'_>, rings: &[Vec<Position>]) -> fmt::Result {
    if rings.is_empty() {
        return write!(f, "EMPTY");
    }
    write!(f, "(")?;
    for (i, ring) in rings.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write_positions(f, ring)?;
    }
    write!(f, ")")
}

/// Twice the signed area of a closed ring; positive when counter-clockwise.
fn signed_area2(ring: &[Position]) -> f64 {
    let mut area = 0.0;
    for pair in ring.windows(2) {
        area += (pair[1].lon - pair[0].lon) * (pair[1].lat + pair[0].lat);
    }
    -area
}

fn normalize_polygon(mut rings: Vec<Vec<Position>>) -> Vec<Vec<Position>> {
    for (index, ring) in rings.iter_mut().enumerate() {
        let ccw = signed_area2(ring) >= 0.0;
        // Exterior ring counter-clockwise, interior rings clockwise.
        if (index == 0) != ccw {
            ring.reverse();
        }
    }
    rings
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn keyword(&mut self) -> String {
        self.skip_whitespace();
        let word: String = self
            .rest()
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        self.pos += word.len();
        word.to_ascii_uppercase()
    }

    fn expect(&mut self, c: char) -> Result<(), WktError> {
        self.skip_whitespace();
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(WktError(format!("expected '{}' at offset {}", c, self.pos)))
        }
    }

    fn peek(&mut self, c: char) -> bool {
        self.skip_whitespace();
        self.rest().starts_with(c)
    }

    fn empty_set(&mut self) -> bool {
        self.skip_whitespace();
        if self.rest().to_ascii_uppercase().starts_with("EMPTY") {
            self.pos += "EMPTY".len();
            true
        } else {
            false
        }
    }

    fn number(&mut self) -> Result<f64, WktError> {
        self.skip_whitespace();
        let len = self
            .rest()
            .chars()
            .take_while(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
            .map(|c| c.len_utf8())
            .sum();
        if len == 0 {
            return Err(WktError(format!("expected number at offset {}", self.pos)));
        }
        let text = &self.rest()[..len];
        let value = text
            .parse::<f64>()
            .map_err(|_| WktError(format!("invalid number {:?} at offset {}", text, self.pos)))?;
        self.pos += len;
        Ok(value)
    }

    fn position(&mut self) -> Result<Position, WktError> {
        let lon = self.number()?;
        let lat = self.number()?;
        // Reject a third (Z or M) coordinate.
        self.skip_whitespace();
        if self
            .rest()
            .chars()
            .next()
            .map(|c| c.is_ascii_digit() || c == '-' || c == '+')
            .unwrap_or(false)
        {
            return Err(WktError(format!(
                "only two-dimensional coordinates are supported (offset {})",
                self.pos
            )));
        }
        Ok(Position::new(lon, lat))
    }

    fn position_list(&mut self) -> Result<Vec<Position>, WktError> {
        self.expect('(')?;
        let mut points = vec![self.position()?];
        while self.peek(',') {
            self.expect(',')?;
            points.push(self.position()?);
        }
        self.expect(')')?;
        Ok(points)
    }

    fn ring(&mut self) -> Result<Vec<Position>, WktError> {
        let ring = self.position_list()?;
        if ring.len() < 4 {
            return Err(WktError("a polygon ring requires at least 4 positions".into()));
        }
        if ring.first() != ring.last() {
            return Err(WktError("polygon ring is not closed".into()));
        }
        Ok(ring)
    }

    fn ring_list(&mut self) -> Result<Vec<Vec<Position>>, WktError> {
        self.expect('(')?;
        let mut rings = vec![self.ring()?];
        while self.peek(',') {
            self.expect(',')?;
            rings.push(self.ring()?);
        }
        self.expect(')')?;
        Ok(rings)
    }

    fn geometry(&mut self) -> Result<Geometry, WktError> {
        let tag = self.keyword();
        match tag.as_str() {
            "POINT" => {
                if self.empty_set() {
                    return Ok(Geometry::Point(None));
                }
                self.expect('(')?;
                let p = self.position()?;
                self.expect(')')?;
                Ok(Geometry::Point(Some(p)))
            }
            "LINESTRING" => {
                if self.empty_set() {
                    return Ok(Geometry::LineString(vec![]));
                }
                Ok(Geometry::LineString(self.position_list()?))
            }
            "POLYGON" => {
                if self.empty_set() {
                    return Ok(Geometry::Polygon(vec![]));
                }
                Ok(Geometry::Polygon(normalize_polygon(self.ring_list()?)))
            }
            "MULTIPOINT" => {
                if self.empty_set() {
                    return Ok(Geometry::MultiPoint(vec![]));
                }
                self.expect('(')?;
                let mut points = vec![self.multipoint_member()?];
                while self.peek(',') {
                    self.expect(',')?;
                    points.push(self.multipoint_member()?);
                }
                self.expect(')')?;
                Ok(Geometry::MultiPoint(points))
            }
            "MULTILINESTRING" => {
                if self.empty_set() {
                    return Ok(Geometry::MultiLineString(vec![]));
                }
                self.expect('(')?;
                let mut lines = vec![self.position_list()?];
                while self.peek(',') {
                    self.expect(',')?;
                    lines.push(self.position_list()?);
                }
                self.expect(')')?;
                Ok(Geometry::MultiLineString(lines))
            }
            "MULTIPOLYGON" => {
                if self.empty_set() {
                    return Ok(Geometry::MultiPolygon(vec![]));
                }
                self.expect('(')?;
                let mut polygons = vec![normalize_polygon(self.ring_list()?)];
                while self.peek(',') {
                    self.expect(',')?;
                    polygons.push(normalize_polygon(self.ring_list()?));
                }
                self.expect(')')?;
                Ok(Geometry::MultiPolygon(polygons))
            }
            other => Err(WktError(format!("unknown geometry type {:?}", other))),
        }
    }

    // MULTIPOINT members may be written bare or parenthesized.
    fn multipoint_member(&mut self) -> Result<Position, WktError> {
        if self.peek('(') {
            self.expect('(')?;
            let p = self.position()?;
            self.expect(')')?;
            Ok(p)
        } else {
            self.position()
        }
    }
}

/// True when `text` begins with one of the WKT geometry keywords.
pub fn is_wkt_prefix(text: &str) -> bool {
    const TAGS: [&str; 6] = [
        "MULTILINESTRING",
        "MULTIPOLYGON",
        "MULTIPOINT",
        "LINESTRING",
        "POLYGON",
        "POINT",
    ];
    let upper = text.to_ascii_uppercase();
    TAGS.iter().any(|tag| {
        upper.starts_with(tag)
            && upper[tag.len()..]
                .chars()
                .next()
                .map(|c| !c.is_ascii_alphanumeric())
                .unwrap_or(true)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn point_round_trip() {
        let g = Geometry::from_wkt("POINT (4.0 52.5)").unwrap();
        assert_eq!(g, Geometry::Point(Some(Position::new(4.0, 52.5))));
        assert_eq!(g.to_string(), "POINT (4 52.5)");
        assert_eq!(Geometry::from_wkt(&g.to_string()).unwrap(), g);
    }

    #[test]
    fn empty_geometries() {
        for wkt in [
            "POINT EMPTY",
            "LINESTRING EMPTY",
            "POLYGON EMPTY",
            "MULTIPOINT EMPTY",
            "MULTILINESTRING EMPTY",
            "MULTIPOLYGON EMPTY",
        ] {
            let g = Geometry::from_wkt(wkt).unwrap();
            assert!(g.is_empty(), "{wkt}");
            assert_eq!(g.to_string(), wkt);
        }
    }

    #[test]
    fn linestring() {
        let g = Geometry::from_wkt("LINESTRING (0 0, 1 1, 2 0)").unwrap();
        assert_eq!(
            g,
            Geometry::LineString(vec![
                Position::new(0.0, 0.0),
                Position::new(1.0, 1.0),
                Position::new(2.0, 0.0),
            ])
        );
    }

    #[test]
    fn polygon_requires_closed_rings() {
        let err = Geometry::from_wkt("POLYGON ((0 0, 1 0, 1 1, 0 0.5))").unwrap_err();
        assert!(err.to_string().contains("not closed"));

        let err = Geometry::from_wkt("POLYGON ((0 0, 1 0, 0 0))").unwrap_err();
        assert!(err.to_string().contains("at least 4"));
    }

    #[test]
    fn exterior_ring_normalized_counter_clockwise() {
        // Clockwise input is reversed on parse.
        let cw = Geometry::from_wkt("POLYGON ((0 0, 0 1, 1 1, 1 0, 0 0))").unwrap();
        let ccw = Geometry::from_wkt("POLYGON ((0 0, 1 0, 1 1, 0 1, 0 0))").unwrap();
        assert_eq!(cw, ccw);
    }

    #[test]
    fn multipoint_accepts_both_member_forms() {
        let bare = Geometry::from_wkt("MULTIPOINT (1 2, 3 4)").unwrap();
        let wrapped = Geometry::from_wkt("MULTIPOINT ((1 2), (3 4))").unwrap();
        assert_eq!(bare, wrapped);
    }

    #[test]
    fn rejects_three_dimensional_coordinates() {
        assert!(Geometry::from_wkt("POINT (1 2 3)").is_err());
    }

    #[test]
    fn wkt_prefix_detection() {
        assert!(is_wkt_prefix("POINT (1 2)"));
        assert!(is_wkt_prefix("MULTIPOLYGON EMPTY"));
        assert!(!is_wkt_prefix("POINTER"));
        assert!(!is_wkt_prefix("product_name"));
    }
}
